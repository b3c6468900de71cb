pub mod ui;

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use core_types::{
    CanvasEdge, CanvasEdgeKey, CanvasNode, CanvasNodeKey, EdgeId, FileId, FileUpload,
    KeyParseError, NodeData, Note, NoteCreate, NoteId, NoteUpdate, Position,
};
use graph_store::{Answer, GraphStore, SearchHits, StoreError};
use i18n::I18n;
use parking_lot::Mutex;
use session::{SessionError, SessionGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ui::{
    EdgeLabelEditor, EdgeMenu, Editor, FileInspector, NoteEditor, Notification, NotificationLevel,
};
use ui::UiState;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid canvas key: {0}")]
    InvalidKey(#[from] KeyParseError),

    #[error("no note editor is open")]
    NoNoteEditor,

    #[error("no edge is selected")]
    NoEdgeSelected,

    #[error("no edge label is being edited")]
    NoLabelEditor,

    #[error("query is empty")]
    EmptyQuery,
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerOptions {
    /// A drag must move strictly further than this on some axis to be saved.
    pub drag_threshold_px: f64,
    pub search_top_k: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            drag_threshold_px: 1.0,
            search_top_k: 5,
        }
    }
}

/// Event handlers of the mind map canvas.
///
/// Each handler validates its input, drives the [`GraphStore`], and reports
/// the outcome as a notification. Failures are also returned to the caller.
pub struct CanvasController {
    store: Arc<GraphStore>,
    i18n: I18n,
    options: ControllerOptions,
    ui: Mutex<UiState>,
}

impl CanvasController {
    pub fn new(store: Arc<GraphStore>, i18n: I18n) -> Self {
        Self::with_options(store, i18n, ControllerOptions::default())
    }

    pub fn with_options(store: Arc<GraphStore>, i18n: I18n, options: ControllerOptions) -> Self {
        Self {
            store,
            i18n,
            options,
            ui: Mutex::new(UiState::default()),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.ui.lock().notifications.clone()
    }

    pub fn take_notifications(&self) -> Vec<Notification> {
        std::mem::take(&mut self.ui.lock().notifications)
    }

    pub fn editor(&self) -> Option<Editor> {
        self.ui.lock().editor.clone()
    }

    pub fn edge_menu(&self) -> Option<EdgeMenu> {
        self.ui.lock().edge_menu.clone()
    }

    pub fn label_editor(&self) -> Option<EdgeLabelEditor> {
        self.ui.lock().label_editor.clone()
    }

    pub fn highlighted(&self) -> Vec<CanvasNodeKey> {
        self.ui.lock().highlighted.clone()
    }

    fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.ui.lock().notifications.push(Notification {
            level,
            message: message.into(),
            created_at: Utc::now(),
        });
    }

    fn success(&self, key: &str, params: &[(&str, &str)]) {
        self.notify(NotificationLevel::Success, self.i18n.tr(key, params));
    }

    /// Logs and reports a failure, handing the error back for propagation.
    fn fail<E>(&self, key: &str, err: E) -> ControllerError
    where
        E: Into<ControllerError> + Display,
    {
        let detail = err.to_string();
        warn!(message_key = key, error = %detail, "canvas action failed");
        self.notify(
            NotificationLevel::Error,
            self.i18n.tr(key, &[("error", &detail)]),
        );
        err.into()
    }

    /// Loads the graph for the signed-in user.
    pub async fn mount(&self, guard: &dyn SessionGuard) -> ControllerResult<()> {
        if let Err(err) = guard.require_session() {
            warn!("refusing to open the canvas without a session");
            self.notify(NotificationLevel::Error, self.i18n.t("session.required"));
            return Err(err.into());
        }
        self.store
            .fetch_graph_data()
            .await
            .map_err(|err| self.fail("graph.load_failed", err))
    }

    pub fn on_node_drag(&self, key: &CanvasNodeKey, position: Position) -> ControllerResult<()> {
        let Some(current) = self.store.snapshot().node(key).map(|node| node.position) else {
            return Err(self.missing_node(key));
        };
        self.ui.lock().drag_origins.entry(*key).or_insert(current);
        self.store
            .move_node_locally(key, position)
            .map_err(ControllerError::from)
    }

    /// Saves the dropped position when the node moved past the drag
    /// threshold. Returns whether a save was attempted and succeeded.
    pub async fn on_node_drag_stop(
        &self,
        key: &CanvasNodeKey,
        position: Position,
    ) -> ControllerResult<bool> {
        let origin = self.ui.lock().drag_origins.remove(key);
        let Some(reference) = self.store.snapshot().node(key).map(|node| {
            node.persisted_position
                .or(origin)
                .unwrap_or(node.position)
        }) else {
            return Err(self.missing_node(key));
        };

        if !position.moved_beyond(&reference, self.options.drag_threshold_px) {
            debug!(key = %key, "drag below threshold; position not saved");
            return Ok(false);
        }

        self.store
            .update_position(key, position)
            .await
            .map_err(|err| self.fail("node.position_failed", err))?;
        Ok(true)
    }

    fn missing_node(&self, key: &CanvasNodeKey) -> ControllerError {
        warn!(key = %key, "event for a node that is not on the canvas");
        self.notify(NotificationLevel::Error, self.i18n.t("node.missing"));
        StoreError::UnknownNode(*key).into()
    }

    /// Connects two nodes given their encoded canvas keys. Malformed keys
    /// are rejected before anything is sent to the backend.
    pub async fn on_connect(&self, source: &str, target: &str) -> ControllerResult<CanvasEdge> {
        let keys = source
            .parse::<CanvasNodeKey>()
            .and_then(|source| Ok((source, target.parse::<CanvasNodeKey>()?)));
        let (source, target) = match keys {
            Ok(keys) => keys,
            Err(err) => {
                warn!(source, target, "rejecting malformed connection");
                return Err(self.fail("edge.invalid", err));
            }
        };

        let edge = self
            .store
            .create_edge(source, target, None)
            .await
            .map_err(|err| self.fail("edge.create_failed", err))?;
        info!(edge = %edge.key, source = %source, target = %target, "nodes connected");
        self.success("edge.created", &[]);
        Ok(edge)
    }

    pub async fn on_edge_remove(&self, encoded: &str) -> ControllerResult<EdgeId> {
        let edge_id = CanvasEdgeKey::parse_confirmed(encoded)
            .map_err(|err| self.fail("edge.invalid", err))?;
        self.store
            .delete_edge(edge_id)
            .await
            .map_err(|err| self.fail("edge.delete_failed", err))?;
        {
            let mut ui = self.ui.lock();
            if ui.edge_menu.as_ref().is_some_and(|menu| menu.edge_id == edge_id) {
                ui.edge_menu = None;
            }
            if ui
                .label_editor
                .as_ref()
                .is_some_and(|editor| editor.edge_id == edge_id)
            {
                ui.label_editor = None;
            }
        }
        self.success("edge.deleted", &[]);
        Ok(edge_id)
    }

    /// Opens the action menu of a confirmed edge.
    pub fn on_edge_click(&self, encoded: &str) -> ControllerResult<EdgeMenu> {
        let edge_id = CanvasEdgeKey::parse_confirmed(encoded)
            .map_err(|err| self.fail("edge.invalid", err))?;
        let snapshot = self.store.snapshot();
        let Some(edge) = snapshot.edge(edge_id) else {
            return Err(self.fail("edge.invalid", StoreError::UnknownEdge(edge_id)));
        };
        let menu = EdgeMenu {
            edge_id,
            source: edge.source,
            target: edge.target,
            label: edge.label.clone(),
        };
        let mut ui = self.ui.lock();
        ui.close_transient();
        ui.edge_menu = Some(menu.clone());
        Ok(menu)
    }

    pub fn begin_edge_label_edit(&self) -> ControllerResult<EdgeLabelEditor> {
        let mut ui = self.ui.lock();
        let menu = ui.edge_menu.take().ok_or(ControllerError::NoEdgeSelected)?;
        let editor = EdgeLabelEditor {
            edge_id: menu.edge_id,
            draft: menu.label.unwrap_or_default(),
        };
        ui.label_editor = Some(editor.clone());
        Ok(editor)
    }

    /// Saves the label being edited. The editor stays open when saving fails.
    pub async fn commit_edge_label(&self, label: &str) -> ControllerResult<CanvasEdge> {
        let edge_id = self
            .ui
            .lock()
            .label_editor
            .as_ref()
            .map(|editor| editor.edge_id)
            .ok_or(ControllerError::NoLabelEditor)?;

        let edge = self
            .store
            .relabel_edge(edge_id, label.trim())
            .await
            .map_err(|err| self.fail("edge.relabel_failed", err))?;
        self.ui.lock().label_editor = None;
        self.success("edge.relabeled", &[]);
        Ok(edge)
    }

    /// Opens an editor for a note node or a read-only inspector for a file.
    pub fn on_node_double_click(&self, key: &CanvasNodeKey) -> ControllerResult<Editor> {
        let snapshot = self.store.snapshot();
        let Some(node) = snapshot.node(key) else {
            return Err(self.missing_node(key));
        };
        let editor = match &node.data {
            NodeData::Note(note) => Editor::Note(NoteEditor {
                key: node.key,
                note_id: note.original_note_id,
                title: note.label.clone(),
                content: note.content.clone().unwrap_or_default(),
                tags: note.tags.clone(),
            }),
            NodeData::File(file) => Editor::File(FileInspector {
                key: node.key,
                file_id: file.original_file_id,
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
                size: file.size,
                created_at: file.created_at,
            }),
        };
        let mut ui = self.ui.lock();
        ui.close_transient();
        ui.editor = Some(editor.clone());
        Ok(editor)
    }

    /// Saves the open note editor. Backend errors are returned to the caller
    /// and leave the editor open.
    pub async fn save_note_edit(&self, update: NoteUpdate) -> ControllerResult<Note> {
        let note_id = match self.ui.lock().editor.as_ref() {
            Some(Editor::Note(editor)) => editor.note_id,
            _ => return Err(ControllerError::NoNoteEditor),
        };
        let note = self
            .store
            .update_note(note_id, update)
            .await
            .map_err(|err| self.fail("note.save_failed", err))?;
        self.ui.lock().editor = None;
        self.success("note.saved", &[]);
        Ok(note)
    }

    pub fn on_pane_click(&self) {
        self.ui.lock().close_transient();
    }

    pub async fn create_note(
        &self,
        title: &str,
        content: &str,
        position: Option<Position>,
    ) -> ControllerResult<Option<CanvasNode>> {
        let mut request = NoteCreate::new(title, content);
        if let Some(position) = position {
            request = request.at(position);
        }
        let node = self
            .store
            .create_note_entity(request)
            .await
            .map_err(|err| self.fail("note.create_failed", err))?;
        self.success("note.created", &[("title", title)]);
        Ok(node)
    }

    pub async fn upload_file(&self, upload: FileUpload) -> ControllerResult<Option<CanvasNode>> {
        let filename = upload.filename.clone();
        let node = self
            .store
            .create_file_entity(upload)
            .await
            .map_err(|err| self.fail("file.upload_failed", err))?;
        self.success("file.uploaded", &[("filename", &filename)]);
        Ok(node)
    }

    pub async fn delete_file(&self, file_id: FileId) -> ControllerResult<()> {
        self.store
            .remove_file_entity(file_id)
            .await
            .map_err(|err| self.fail("file.delete_failed", err))?;
        self.close_editor_for(|editor| matches!(editor, Editor::File(file) if file.file_id == file_id));
        self.success("file.deleted", &[]);
        Ok(())
    }

    pub async fn delete_note(&self, note_id: NoteId) -> ControllerResult<()> {
        self.store
            .remove_note_entity(note_id)
            .await
            .map_err(|err| self.fail("note.delete_failed", err))?;
        self.close_editor_for(|editor| matches!(editor, Editor::Note(note) if note.note_id == note_id));
        self.success("note.deleted", &[]);
        Ok(())
    }

    fn close_editor_for(&self, matches: impl Fn(&Editor) -> bool) {
        let mut ui = self.ui.lock();
        if ui.editor.as_ref().is_some_and(matches) {
            ui.editor = None;
        }
    }

    /// Semantic note search; matching notes are highlighted on the canvas.
    pub async fn search(&self, query: &str) -> ControllerResult<SearchHits> {
        let query = query.trim();
        if query.is_empty() {
            self.ui.lock().highlighted.clear();
            return Err(ControllerError::EmptyQuery);
        }
        let hits = self
            .store
            .search_notes(query, self.options.search_top_k)
            .await
            .map_err(|err| self.fail("search.failed", err))?;
        self.ui.lock().highlighted = hits.highlighted.clone();
        let count = hits.response.results.len().to_string();
        self.notify(
            NotificationLevel::Info,
            self.i18n.tr("search.results", &[("count", &count)]),
        );
        Ok(hits)
    }

    /// Asks the assistant; the notes it cites are highlighted.
    pub async fn ask(&self, query: &str) -> ControllerResult<Answer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ControllerError::EmptyQuery);
        }
        let answer = self
            .store
            .ask(query)
            .await
            .map_err(|err| self.fail("ask.failed", err))?;
        self.ui.lock().highlighted = answer.highlighted.clone();
        Ok(answer)
    }
}
