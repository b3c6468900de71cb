use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{CanvasEdgeKey, CanvasNodeKey, FileId, GraphNodeId, NodeKind, NoteId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// True when either axis moved strictly more than `threshold`.
    pub fn moved_beyond(&self, other: &Position, threshold: f64) -> bool {
        (self.x - other.x).abs() > threshold || (self.y - other.y).abs() > threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteNodeData {
    pub graph_node_id: GraphNodeId,
    pub original_note_id: NoteId,
    pub label: String,
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileNodeData {
    pub graph_node_id: GraphNodeId,
    pub original_file_id: FileId,
    pub label: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeData {
    Note(NoteNodeData),
    File(FileNodeData),
}

impl NodeData {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeData::Note(_) => NodeKind::Note,
            NodeData::File(_) => NodeKind::File,
        }
    }

    pub fn graph_node_id(&self) -> GraphNodeId {
        match self {
            NodeData::Note(note) => note.graph_node_id,
            NodeData::File(file) => file.graph_node_id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            NodeData::Note(note) => &note.label,
            NodeData::File(file) => &file.label,
        }
    }

    /// Id of the owning note or file record.
    pub fn back_reference(&self) -> i64 {
        match self {
            NodeData::Note(note) => note.original_note_id,
            NodeData::File(file) => file.original_file_id,
        }
    }

    pub fn as_note(&self) -> Option<&NoteNodeData> {
        match self {
            NodeData::Note(note) => Some(note),
            NodeData::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNodeData> {
        match self {
            NodeData::File(file) => Some(file),
            NodeData::Note(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanvasNode {
    pub key: CanvasNodeKey,
    /// Where the node is drawn; moves during a drag before anything is saved.
    pub position: Position,
    /// Last position acknowledged by the backend, if any.
    pub persisted_position: Option<Position>,
    pub data: NodeData,
}

impl CanvasNode {
    pub fn owns(&self, kind: NodeKind, back_reference: i64) -> bool {
        self.key.kind == kind && self.data.back_reference() == back_reference
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanvasEdge {
    pub key: CanvasEdgeKey,
    pub source: CanvasNodeKey,
    pub target: CanvasNodeKey,
    pub label: Option<String>,
}

impl CanvasEdge {
    pub fn touches(&self, node: &CanvasNodeKey) -> bool {
        &self.source == node || &self.target == node
    }
}

/// Local-only field merge for a canvas node. `None` leaves a field as is;
/// note-only fields are ignored on file nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub label: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub position: Option<Position>,
    pub persisted_position: Option<Position>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl NodePatch {
    pub fn apply(&self, node: &mut CanvasNode) {
        if let Some(position) = self.position {
            node.position = position;
        }
        if let Some(position) = self.persisted_position {
            node.persisted_position = Some(position);
        }
        match &mut node.data {
            NodeData::Note(note) => {
                if let Some(label) = &self.label {
                    note.label = label.clone();
                }
                if let Some(content) = &self.content {
                    note.content = Some(content.clone());
                }
                if let Some(tags) = &self.tags {
                    note.tags = tags.clone();
                }
                if self.updated_at.is_some() {
                    note.updated_at = self.updated_at;
                }
            }
            NodeData::File(file) => {
                if let Some(label) = &self.label {
                    file.label = label.clone();
                }
            }
        }
    }
}
