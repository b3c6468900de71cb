use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::TokenSource;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session; log in first")]
    Unauthenticated,
}

/// Gate consumed by anything that must not run without a logged-in user.
pub trait SessionGuard: Send + Sync {
    fn require_session(&self) -> std::result::Result<(), SessionError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    schema_version: u32,
    #[serde(default)]
    token: Option<String>,
}

/// Persists the bearer token only; user details are re-fetched on start.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join("session.json")
    }

    pub fn load_token(&self) -> Result<Option<String>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: SessionFile = serde_json::from_str(&text).context("failed to parse session")?;
        Ok(doc.token.filter(|token| !token.trim().is_empty()))
    }

    pub fn save_token(&self, token: Option<&str>) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let doc = SessionFile {
            schema_version: SCHEMA_VERSION,
            token: token.map(str::to_string),
        };
        let text = serde_json::to_string_pretty(&doc)?;
        fs::write(self.path(), text)
            .with_context(|| format!("failed to write {}", self.path().display()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Session {
    store: SessionStore,
    token: RwLock<Option<String>>,
}

impl Session {
    /// Rehydrates the persisted token, if one was saved earlier.
    pub fn restore(store: SessionStore) -> Result<Self> {
        let token = store.load_token()?;
        if token.is_some() {
            info!("restored persisted session token");
        }
        Ok(Self {
            store,
            token: RwLock::new(token),
        })
    }

    pub fn set_token(&self, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        self.store.save_token(Some(&token))?;
        *self.token.write() = Some(token);
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn logout(&self) -> Result<()> {
        self.store.save_token(None)?;
        *self.token.write() = None;
        info!("session cleared");
        Ok(())
    }
}

impl TokenSource for Session {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

impl SessionGuard for Session {
    fn require_session(&self) -> std::result::Result<(), SessionError> {
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(SessionError::Unauthenticated)
        }
    }
}

pub fn default_session_dir_from(base_dir: &Path) -> PathBuf {
    base_dir.join("session")
}
