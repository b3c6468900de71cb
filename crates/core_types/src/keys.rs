//! Structured identities for canvas nodes and edges.
//!
//! The canvas addresses nodes as `"<kind>-<graph node id>"` and edges as
//! `"edge-<edge id>"`. These strings are only an encoding: every component
//! works with [`CanvasNodeKey`] / [`CanvasEdgeKey`] and converts at the edge
//! of the system with `Display` / `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub type GraphNodeId = i64;
pub type EdgeId = i64;
pub type NoteId = i64;
pub type FileId = i64;

const EDGE_PREFIX: &str = "edge";
const PENDING_PREFIX: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("`{0}` is missing the `-` separator")]
    MissingSeparator(String),
    #[error("unknown node kind `{0}`")]
    UnknownKind(String),
    #[error("expected prefix `{expected}` in `{value}`")]
    WrongPrefix { expected: &'static str, value: String },
    #[error("`{0}` is not a valid numeric id")]
    InvalidId(String),
    #[error("`{0}` is not a valid pending edge id")]
    InvalidPendingId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Note,
    File,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Note => "note",
            NodeKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" => Some(NodeKind::Note),
            "file" => Some(NodeKind::File),
            _ => None,
        }
    }

    /// Key inside a graph node's `data` payload that points back at the
    /// owning note or file record.
    pub fn back_reference_key(self) -> &'static str {
        match self {
            NodeKind::Note => "original_note_id",
            NodeKind::File => "original_file_id",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanvasNodeKey {
    pub kind: NodeKind,
    pub id: GraphNodeId,
}

impl CanvasNodeKey {
    pub fn new(kind: NodeKind, id: GraphNodeId) -> Self {
        Self { kind, id }
    }

    pub fn note(id: GraphNodeId) -> Self {
        Self::new(NodeKind::Note, id)
    }

    pub fn file(id: GraphNodeId) -> Self {
        Self::new(NodeKind::File, id)
    }
}

impl fmt::Display for CanvasNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

impl FromStr for CanvasNodeKey {
    type Err = KeyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, id) = value
            .split_once('-')
            .ok_or_else(|| KeyParseError::MissingSeparator(value.to_string()))?;
        let kind =
            NodeKind::parse(kind).ok_or_else(|| KeyParseError::UnknownKind(kind.to_string()))?;
        Ok(Self {
            kind,
            id: parse_digits(id, value)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanvasEdgeKey {
    Confirmed(EdgeId),
    /// Optimistic edge that the backend has not acknowledged yet.
    Pending(Uuid),
}

impl CanvasEdgeKey {
    pub fn confirmed_id(&self) -> Option<EdgeId> {
        match self {
            CanvasEdgeKey::Confirmed(id) => Some(*id),
            CanvasEdgeKey::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CanvasEdgeKey::Pending(_))
    }

    /// Parses an `"edge-<id>"` string, rejecting pending keys.
    pub fn parse_confirmed(value: &str) -> Result<EdgeId, KeyParseError> {
        match value.split_once('-') {
            Some((EDGE_PREFIX, id)) => parse_digits(id, value),
            Some(_) => Err(KeyParseError::WrongPrefix {
                expected: EDGE_PREFIX,
                value: value.to_string(),
            }),
            None => Err(KeyParseError::MissingSeparator(value.to_string())),
        }
    }
}

impl fmt::Display for CanvasEdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanvasEdgeKey::Confirmed(id) => write!(f, "{EDGE_PREFIX}-{id}"),
            CanvasEdgeKey::Pending(id) => write!(f, "{PENDING_PREFIX}-{id}"),
        }
    }
}

impl FromStr for CanvasEdgeKey {
    type Err = KeyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = value.strip_prefix("pending-") {
            return Uuid::parse_str(rest)
                .map(CanvasEdgeKey::Pending)
                .map_err(|_| KeyParseError::InvalidPendingId(value.to_string()));
        }
        Self::parse_confirmed(value).map(CanvasEdgeKey::Confirmed)
    }
}

fn parse_digits(digits: &str, whole: &str) -> Result<i64, KeyParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyParseError::InvalidId(whole.to_string()));
    }
    digits
        .parse::<i64>()
        .map_err(|_| KeyParseError::InvalidId(whole.to_string()))
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(CanvasNodeKey);
string_serde!(CanvasEdgeKey);
