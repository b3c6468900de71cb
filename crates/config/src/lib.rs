use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::UiLanguage;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Per-request timeout. `None` leaves requests unbounded.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    #[serde(default = "default_position_bound")]
    pub default_position_bound: f64,
    #[serde(default = "default_drag_threshold")]
    pub drag_threshold_px: f64,
    #[serde(default)]
    pub revert_position_on_failure: bool,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            default_position_bound: default_position_bound(),
            drag_threshold_px: default_drag_threshold(),
            revert_position_on_failure: false,
            page_limit: default_page_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

const fn default_position_bound() -> f64 {
    400.0
}

const fn default_drag_threshold() -> f64 {
    1.0
}

const fn default_page_limit() -> u32 {
    100
}

const fn default_top_k() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Missing in hand-written files, which load as version 0.
    #[serde(default)]
    pub schema_version: u32,
    pub language: UiLanguage,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            language: UiLanguage::EnUs,
            api: ApiConfig::default(),
            canvas: CanvasConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        self.migrate(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        config.api.base_url = config.api.base_url.trim_end_matches('/').to_string();
        if config.canvas.drag_threshold_px <= 0.0 {
            config.canvas.drag_threshold_px = default_drag_threshold();
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
