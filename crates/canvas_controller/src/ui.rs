//! Transient interface state owned by the controller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use core_types::{CanvasNodeKey, EdgeId, FileId, NoteId, Position};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_error(&self) -> bool {
        self.level == NotificationLevel::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteEditor {
    pub key: CanvasNodeKey,
    pub note_id: NoteId,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

/// Read-only view of a file node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInspector {
    pub key: CanvasNodeKey,
    pub file_id: FileId,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Editor {
    Note(NoteEditor),
    File(FileInspector),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeMenu {
    pub edge_id: EdgeId,
    pub source: CanvasNodeKey,
    pub target: CanvasNodeKey,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeLabelEditor {
    pub edge_id: EdgeId,
    pub draft: String,
}

#[derive(Debug, Default)]
pub(crate) struct UiState {
    pub notifications: Vec<Notification>,
    pub editor: Option<Editor>,
    pub edge_menu: Option<EdgeMenu>,
    pub label_editor: Option<EdgeLabelEditor>,
    pub highlighted: Vec<CanvasNodeKey>,
    /// Where each node sat when its current drag started.
    pub drag_origins: HashMap<CanvasNodeKey, Position>,
}

impl UiState {
    pub fn close_transient(&mut self) {
        self.editor = None;
        self.edge_menu = None;
        self.label_editor = None;
    }
}
