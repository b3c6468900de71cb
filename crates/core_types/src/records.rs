//! Records exchanged with the notes/files/graph backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canvas::Position;
use crate::keys::{EdgeId, FileId, GraphNodeId, NodeKind, NoteId};
use crate::timestamp;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: NoteId,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub position_x: Option<f64>,
    #[serde(default)]
    pub position_y: Option<f64>,
    #[serde(default)]
    pub graph_node_id: Option<GraphNodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn position(&self) -> Option<Position> {
        Some(Position::new(self.position_x?, self.position_y?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub id: FileId,
    #[serde(default)]
    pub user_id: i64,
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub graph_node_id: Option<GraphNodeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RawPosition {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: GraphNodeId,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub label: Option<String>,
    pub node_type: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub position: Option<RawPosition>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::parse(&self.node_type)
    }

    pub fn stored_position(&self) -> Option<Position> {
        let raw = self.position?;
        Some(Position::new(raw.x?, raw.y?))
    }

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data_value(key)?.as_str()
    }

    /// Id of the note or file that owns this graph node, read from `data`.
    pub fn back_reference(&self) -> Option<i64> {
        let kind = self.kind()?;
        self.data_value(kind.back_reference_key())?.as_i64()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub id: EdgeId,
    #[serde(default)]
    pub user_id: i64,
    pub source_node_id: GraphNodeId,
    pub target_node_id: GraphNodeId,
    #[serde(default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteCreate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
}

impl NoteCreate {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: Some(content.into()),
            position_x: None,
            position_y: None,
        }
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position_x = Some(position.x);
        self.position_y = Some(position.y);
        self
    }
}

/// Partial note update; absent fields are left untouched by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NoteUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl NoteUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn position(position: Position) -> Self {
        Self {
            position_x: Some(position.x),
            position_y: Some(position.y),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FilePositionUpdate {
    pub position_x: f64,
    pub position_y: f64,
}

impl From<Position> for FilePositionUpdate {
    fn from(position: Position) -> Self {
        Self {
            position_x: position.x,
            position_y: position.y,
        }
    }
}

/// File contents handed to the upload endpoint as a multipart `file` field.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdgeCreate {
    pub source_node_id: GraphNodeId,
    pub target_node_id: GraphNodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GraphEdgeUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchMatch {
    pub id: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SearchMatch {
    pub fn note_id(&self) -> Option<NoteId> {
        self.metadata.get("note_id")?.as_i64()
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagSource {
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagAnswer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<RagSource>,
}
