use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use core_types::{
    ApiError, CanvasEdge, CanvasEdgeKey, CanvasNode, CanvasNodeKey, EdgeId, FileId, FileUpload,
    GraphApi, GraphEdge, GraphEdgeCreate, GraphEdgeUpdate, NodeKind, NodePatch, Note, NoteCreate,
    NoteId, NoteUpdate, Position,
};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mapper::{
    DroppedEdge, file_to_canvas_node, index_nodes, note_to_canvas_node, to_canvas_edge,
    to_canvas_node,
};

pub const DEFAULT_RELATIONSHIP: &str = "related";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("node {0} is not on the canvas")]
    UnknownNode(CanvasNodeKey),

    #[error("edge {0} is not on the canvas")]
    UnknownEdge(EdgeId),

    #[error("edge {} references nodes that are not on the canvas", .0.edge_id)]
    EdgeDropped(DroppedEdge),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    /// Upper bound of the random square used for nodes without a stored position.
    pub position_bound: f64,
    pub revert_position_on_failure: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            position_bound: 400.0,
            revert_position_on_failure: false,
        }
    }
}

/// Lifecycle of an optimistic edge creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EdgeMutation {
    Pending,
    Committed { edge_id: EdgeId },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEdge {
    pub edge: CanvasEdge,
    pub state: EdgeMutation,
}

/// Counter that increases every time an entity of some kind is created,
/// together with the id of the most recent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitySignal {
    pub sequence: u64,
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub revision: u64,
    pub nodes: Vec<CanvasNode>,
    pub edges: Vec<CanvasEdge>,
    pub pending_edges: Vec<PendingEdge>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_note_created: Option<EntitySignal>,
    pub last_file_uploaded: Option<EntitySignal>,
    pub dropped_edges: Vec<DroppedEdge>,
}

impl GraphSnapshot {
    pub fn node(&self, key: &CanvasNodeKey) -> Option<&CanvasNode> {
        self.nodes.iter().find(|node| &node.key == key)
    }

    pub fn edge(&self, edge_id: EdgeId) -> Option<&CanvasEdge> {
        self.edges
            .iter()
            .find(|edge| edge.key.confirmed_id() == Some(edge_id))
    }

    /// Confirmed edges followed by the ones still awaiting the backend.
    pub fn visible_edges(&self) -> impl Iterator<Item = &CanvasEdge> {
        self.edges
            .iter()
            .chain(self.pending_edges.iter().map(|pending| &pending.edge))
    }
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: Vec<CanvasNode>,
    edges: Vec<CanvasEdge>,
    pending_edges: Vec<PendingEdge>,
    fetches_in_flight: usize,
    error: Option<String>,
    last_note_created: Option<EntitySignal>,
    last_file_uploaded: Option<EntitySignal>,
    dropped_edges: Vec<DroppedEdge>,
}

impl GraphState {
    fn node(&self, key: &CanvasNodeKey) -> Option<&CanvasNode> {
        self.nodes.iter().find(|node| &node.key == key)
    }

    fn node_mut(&mut self, key: &CanvasNodeKey) -> Option<&mut CanvasNode> {
        self.nodes.iter_mut().find(|node| &node.key == key)
    }

    fn upsert_node(&mut self, node: CanvasNode) {
        match self.node_mut(&node.key) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Removes every node owned by the given record and every edge that
    /// touches one of them. Returns the removed node keys.
    fn remove_owned(&mut self, kind: NodeKind, back_reference: i64) -> Vec<CanvasNodeKey> {
        let removed: Vec<CanvasNodeKey> = self
            .nodes
            .iter()
            .filter(|node| node.owns(kind, back_reference))
            .map(|node| node.key)
            .collect();
        self.nodes.retain(|node| !removed.contains(&node.key));
        self.edges
            .retain(|edge| !removed.iter().any(|key| edge.touches(key)));
        self.pending_edges
            .retain(|pending| !removed.iter().any(|key| pending.edge.touches(key)));
        removed
    }

    fn record_dropped(&mut self, dropped: DroppedEdge) {
        if !self.dropped_edges.contains(&dropped) {
            self.dropped_edges.push(dropped);
        }
    }
}

/// Client-side model of the graph, kept in sync with the backend.
///
/// Mutations go to the backend first and are merged locally once the call
/// succeeds. The lock is never held across an `.await`, so concurrent
/// mutations interleave and the last response to arrive wins.
pub struct GraphStore {
    api: Arc<dyn GraphApi>,
    options: StoreOptions,
    state: RwLock<GraphState>,
    revision: watch::Sender<u64>,
    sequence: AtomicU64,
}

impl GraphStore {
    pub fn new(api: Arc<dyn GraphApi>) -> Self {
        Self::with_options(api, StoreOptions::default())
    }

    pub fn with_options(api: Arc<dyn GraphApi>, options: StoreOptions) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            api,
            options,
            state: RwLock::new(GraphState::default()),
            revision,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn api(&self) -> &Arc<dyn GraphApi> {
        &self.api
    }

    /// Receiver that observes a new revision number after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.read();
        GraphSnapshot {
            revision: *self.revision.borrow(),
            nodes: state.nodes.clone(),
            edges: state.edges.clone(),
            pending_edges: state.pending_edges.clone(),
            loading: state.fetches_in_flight > 0,
            error: state.error.clone(),
            last_note_created: state.last_note_created,
            last_file_uploaded: state.last_file_uploaded,
            dropped_edges: state.dropped_edges.clone(),
        }
    }

    fn mutate<T>(&self, change: impl FnOnce(&mut GraphState) -> T) -> T {
        let result = {
            let mut state = self.state.write();
            change(&mut state)
        };
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    fn next_signal(&self, id: i64) -> EntitySignal {
        EntitySignal {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            id,
        }
    }

    /// Replaces nodes and edges with the backend's current graph. On failure
    /// the error is recorded and the previous graph is left in place.
    ///
    /// Overlapping fetches each apply their own result in completion order;
    /// `loading` stays set until the last one has finished.
    pub async fn fetch_graph_data(&self) -> StoreResult<()> {
        self.mutate(|state| {
            state.fetches_in_flight += 1;
            state.error = None;
        });

        let fetched = futures::try_join!(self.api.list_graph_nodes(), self.api.list_graph_edges());
        let (graph_nodes, graph_edges) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "failed to fetch graph");
                self.mutate(|state| {
                    state.fetches_in_flight -= 1;
                    state.error = Some(err.to_string());
                });
                return Err(err.into());
            }
        };

        let nodes: Vec<CanvasNode> = {
            let mut rng = rand::thread_rng();
            graph_nodes
                .iter()
                .filter_map(|node| to_canvas_node(node, self.options.position_bound, &mut rng))
                .collect()
        };
        let index = index_nodes(&nodes);
        let mut edges = Vec::with_capacity(graph_edges.len());
        let mut dropped = Vec::new();
        for edge in &graph_edges {
            match to_canvas_edge(edge, &index) {
                Ok(edge) => edges.push(edge),
                Err(missing) => {
                    warn!(
                        edge_id = missing.edge_id,
                        source_node_id = missing.source_node_id,
                        target_node_id = missing.target_node_id,
                        "dropping edge with unknown endpoint"
                    );
                    dropped.push(missing);
                }
            }
        }

        info!(
            nodes = nodes.len(),
            edges = edges.len(),
            dropped_edges = dropped.len(),
            skipped_nodes = graph_nodes.len() - nodes.len(),
            "graph loaded"
        );
        self.mutate(|state| {
            state.nodes = nodes;
            state.edges = edges;
            state.dropped_edges = dropped;
            state.fetches_in_flight -= 1;
        });
        Ok(())
    }

    /// Creates a note and places it on the canvas. Returns `None` when the
    /// backend saved the note without linking a graph node; the graph is
    /// reloaded in that case and the node shows up once the backend has one.
    pub async fn create_note_entity(&self, note: NoteCreate) -> StoreResult<Option<CanvasNode>> {
        let created = self.api.create_note(&note).await?;
        let node = {
            let mut rng = rand::thread_rng();
            note_to_canvas_node(&created, self.options.position_bound, &mut rng)
        };
        let signal = self.next_signal(created.id);

        let Some(node) = node else {
            warn!(note_id = created.id, "created note has no graph node, reloading graph");
            self.mutate(|state| state.last_note_created = Some(signal));
            return Ok(self.reload_owned(NodeKind::Note, created.id).await);
        };

        debug!(note_id = created.id, key = %node.key, "note created");
        self.mutate(|state| {
            state.upsert_node(node.clone());
            state.last_note_created = Some(signal);
        });
        Ok(Some(node))
    }

    /// Uploads a file and places it on the canvas, with the same handling of
    /// a missing graph node as [`GraphStore::create_note_entity`].
    pub async fn create_file_entity(&self, upload: FileUpload) -> StoreResult<Option<CanvasNode>> {
        let created = self.api.upload_file(upload).await?;
        let node = {
            let mut rng = rand::thread_rng();
            file_to_canvas_node(&created, self.options.position_bound, &mut rng)
        };
        let signal = self.next_signal(created.id);

        let Some(node) = node else {
            warn!(file_id = created.id, "uploaded file has no graph node, reloading graph");
            self.mutate(|state| state.last_file_uploaded = Some(signal));
            return Ok(self.reload_owned(NodeKind::File, created.id).await);
        };

        debug!(file_id = created.id, key = %node.key, "file uploaded");
        self.mutate(|state| {
            state.upsert_node(node.clone());
            state.last_file_uploaded = Some(signal);
        });
        Ok(Some(node))
    }

    /// Reloads the graph and looks up the node owned by a freshly created
    /// record. A failed reload is recorded in the state and not returned:
    /// the record itself was saved.
    async fn reload_owned(&self, kind: NodeKind, back_reference: i64) -> Option<CanvasNode> {
        if self.fetch_graph_data().await.is_err() {
            return None;
        }
        self.state
            .read()
            .nodes
            .iter()
            .find(|node| node.owns(kind, back_reference))
            .cloned()
    }

    /// Local-only merge of node fields.
    pub fn update_node_field(&self, key: &CanvasNodeKey, patch: &NodePatch) -> StoreResult<()> {
        self.mutate(|state| {
            let node = state.node_mut(key).ok_or(StoreError::UnknownNode(*key))?;
            patch.apply(node);
            Ok(())
        })
    }

    pub fn move_node_locally(&self, key: &CanvasNodeKey, position: Position) -> StoreResult<()> {
        self.update_node_field(
            key,
            &NodePatch {
                position: Some(position),
                ..NodePatch::default()
            },
        )
    }

    pub async fn update_note_content(
        &self,
        note_id: NoteId,
        content: impl Into<String>,
    ) -> StoreResult<Note> {
        self.update_note(note_id, NoteUpdate::content(content)).await
    }

    /// Sends a partial note update and merges the backend's answer into the
    /// matching canvas node. Nothing changes locally when the call fails.
    pub async fn update_note(&self, note_id: NoteId, update: NoteUpdate) -> StoreResult<Note> {
        let note = self.api.update_note(note_id, &update).await?;
        let patch = NodePatch {
            label: note.title.clone(),
            content: note.content.clone(),
            tags: note.tags.clone(),
            updated_at: note.updated_at,
            ..NodePatch::default()
        };

        let merged = self.mutate(|state| {
            let key = note
                .graph_node_id
                .map(CanvasNodeKey::note)
                .filter(|key| state.node(key).is_some())
                .or_else(|| {
                    state
                        .nodes
                        .iter()
                        .find(|node| node.owns(NodeKind::Note, note_id))
                        .map(|node| node.key)
                });
            match key.and_then(|key| state.node_mut(&key)) {
                Some(node) => {
                    patch.apply(node);
                    true
                }
                None => false,
            }
        });
        if !merged {
            warn!(note_id, "updated note has no node on the canvas");
        }
        Ok(note)
    }

    /// Persists a node position. The node is resolved to its owning note or
    /// file and the matching endpoint is called; the canvas is updated once
    /// the backend accepts the position.
    pub async fn update_position(&self, key: &CanvasNodeKey, position: Position) -> StoreResult<()> {
        let (back_reference, previous) = {
            let state = self.state.read();
            let node = state.node(key).ok_or(StoreError::UnknownNode(*key))?;
            (node.data.back_reference(), node.persisted_position)
        };

        let saved = match key.kind {
            NodeKind::Note => self
                .api
                .update_note(back_reference, &NoteUpdate::position(position))
                .await
                .map(|_| ()),
            NodeKind::File => self
                .api
                .update_file_position(back_reference, position)
                .await
                .map(|_| ()),
        };

        if let Err(err) = saved {
            warn!(key = %key, error = %err, "failed to persist node position");
            if self.options.revert_position_on_failure {
                if let Some(previous) = previous {
                    if self.move_node_locally(key, previous).is_err() {
                        debug!(key = %key, "node removed before its position could be reverted");
                    }
                }
            }
            return Err(err.into());
        }

        let patch = NodePatch {
            position: Some(position),
            persisted_position: Some(position),
            ..NodePatch::default()
        };
        if self.update_node_field(key, &patch).is_err() {
            debug!(key = %key, "node removed before its position was saved");
        }
        Ok(())
    }

    pub async fn remove_file_entity(&self, file_id: FileId) -> StoreResult<()> {
        self.api.delete_file(file_id).await?;
        let removed = self.mutate(|state| state.remove_owned(NodeKind::File, file_id));
        info!(file_id, removed_nodes = removed.len(), "file removed");
        Ok(())
    }

    pub async fn remove_note_entity(&self, note_id: NoteId) -> StoreResult<()> {
        self.api.delete_note(note_id).await?;
        let removed = self.mutate(|state| state.remove_owned(NodeKind::Note, note_id));
        info!(note_id, removed_nodes = removed.len(), "note removed");
        Ok(())
    }

    /// Inserts a confirmed edge. Adding the same backend edge twice keeps a
    /// single copy; edges whose endpoints are unknown are recorded and dropped.
    pub fn add_edge(&self, edge: &GraphEdge) -> Result<CanvasEdge, DroppedEdge> {
        self.mutate(|state| {
            let index = index_nodes(&state.nodes);
            match to_canvas_edge(edge, &index) {
                Ok(mapped) => {
                    match state.edges.iter_mut().find(|known| known.key == mapped.key) {
                        Some(existing) => *existing = mapped.clone(),
                        None => state.edges.push(mapped.clone()),
                    }
                    Ok(mapped)
                }
                Err(dropped) => {
                    warn!(
                        edge_id = dropped.edge_id,
                        source_node_id = dropped.source_node_id,
                        target_node_id = dropped.target_node_id,
                        "dropping edge with unknown endpoint"
                    );
                    state.record_dropped(dropped.clone());
                    Err(dropped)
                }
            }
        })
    }

    /// Local removal of a confirmed edge; returns whether it was present.
    pub fn remove_edge(&self, edge_id: EdgeId) -> bool {
        self.mutate(|state| {
            let before = state.edges.len();
            state
                .edges
                .retain(|edge| edge.key.confirmed_id() != Some(edge_id));
            before != state.edges.len()
        })
    }

    /// Creates an edge optimistically: a pending edge is shown right away and
    /// is either replaced by the confirmed edge or discarded when the backend
    /// rejects it.
    pub async fn create_edge(
        &self,
        source: CanvasNodeKey,
        target: CanvasNodeKey,
        relationship: Option<String>,
    ) -> StoreResult<CanvasEdge> {
        let relationship = relationship
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RELATIONSHIP.to_string());
        let pending_key = CanvasEdgeKey::Pending(Uuid::new_v4());

        self.mutate(|state| {
            for key in [&source, &target] {
                if state.node(key).is_none() {
                    return Err(StoreError::UnknownNode(*key));
                }
            }
            state.pending_edges.push(PendingEdge {
                edge: CanvasEdge {
                    key: pending_key,
                    source,
                    target,
                    label: Some(relationship.clone()),
                },
                state: EdgeMutation::Pending,
            });
            Ok(())
        })?;

        let request = GraphEdgeCreate {
            source_node_id: source.id,
            target_node_id: target.id,
            relationship_type: Some(relationship),
            data: None,
        };
        match self.api.create_edge(&request).await {
            Ok(edge) => {
                self.settle_pending(pending_key, EdgeMutation::Committed { edge_id: edge.id });
                self.add_edge(&edge).map_err(StoreError::EdgeDropped)
            }
            Err(err) => {
                warn!(source = %source, target = %target, error = %err, "edge creation rejected");
                self.settle_pending(
                    pending_key,
                    EdgeMutation::Failed {
                        reason: err.to_string(),
                    },
                );
                Err(err.into())
            }
        }
    }

    fn settle_pending(&self, key: CanvasEdgeKey, outcome: EdgeMutation) {
        self.mutate(|state| {
            if let Some(pending) = state
                .pending_edges
                .iter_mut()
                .find(|pending| pending.edge.key == key)
            {
                pending.state = outcome.clone();
            }
            state.pending_edges.retain(|pending| pending.edge.key != key);
        });
        debug!(key = %key, outcome = ?outcome, "pending edge settled");
    }

    pub async fn delete_edge(&self, edge_id: EdgeId) -> StoreResult<()> {
        self.api.delete_edge(edge_id).await?;
        if !self.remove_edge(edge_id) {
            debug!(edge_id, "deleted edge was not on the canvas");
        }
        Ok(())
    }

    pub async fn relabel_edge(&self, edge_id: EdgeId, label: impl Into<String>) -> StoreResult<CanvasEdge> {
        let update = GraphEdgeUpdate {
            relationship_type: Some(label.into()),
            data: None,
        };
        let edge = self.api.update_edge(edge_id, &update).await?;
        self.mutate(|state| {
            let existing = state
                .edges
                .iter_mut()
                .find(|known| known.key.confirmed_id() == Some(edge_id))
                .ok_or(StoreError::UnknownEdge(edge_id))?;
            existing.label = edge.relationship_type.clone();
            Ok(existing.clone())
        })
    }

    pub async fn download_file(&self, file_id: FileId) -> StoreResult<Vec<u8>> {
        Ok(self.api.download_file(file_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ApiCall, FakeGraphApi, Op};

    fn store_with(api: &Arc<FakeGraphApi>) -> GraphStore {
        GraphStore::new(api.clone())
    }

    fn server_error() -> ApiError {
        ApiError::Status {
            status: 500,
            detail: "Internal Server Error".to_string(),
        }
    }

    #[tokio::test]
    async fn fetch_after_create_includes_new_note() {
        let api = Arc::new(FakeGraphApi::new());
        let store = store_with(&api);

        store
            .create_note_entity(NoteCreate::new("T", "C"))
            .await
            .expect("create");
        store.fetch_graph_data().await.expect("fetch");

        let snapshot = store.snapshot();
        let note = snapshot
            .nodes
            .iter()
            .filter_map(|node| node.data.as_note())
            .find(|note| note.label == "T")
            .expect("note node");
        assert_eq!(note.content.as_deref(), Some("C"));
        assert!(!snapshot.loading);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn create_note_adds_node_and_bumps_signal() {
        let api = Arc::new(FakeGraphApi::new());
        let store = store_with(&api);

        let first = store
            .create_note_entity(NoteCreate::new("Shopping", "Milk, eggs"))
            .await
            .expect("create")
            .expect("node");
        let second = store
            .create_note_entity(NoteCreate::new("Todo", ""))
            .await
            .expect("create")
            .expect("node");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(first.key.kind, NodeKind::Note);
        assert!(first.key.to_string().starts_with("note-"));
        assert_eq!(first.data.label(), "Shopping");
        let signal = snapshot.last_note_created.expect("signal");
        assert_eq!(signal.id, second.data.back_reference());
        assert_eq!(signal.sequence, 2);
        assert!(snapshot.last_file_uploaded.is_none());
    }

    #[tokio::test]
    async fn failed_create_leaves_state_untouched() {
        let api = Arc::new(FakeGraphApi::new());
        let store = store_with(&api);
        api.fail_next(Op::CreateNote, server_error());

        let err = store
            .create_note_entity(NoteCreate::new("x", "y"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, StoreError::Api(ApiError::Status { status: 500, .. })));
        let snapshot = store.snapshot();
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.last_note_created.is_none());
    }

    #[tokio::test]
    async fn create_without_graph_node_reloads_instead_of_failing() {
        let api = Arc::new(FakeGraphApi::new());
        api.hide_graph_node_ids();
        let store = store_with(&api);

        let node = store
            .create_note_entity(NoteCreate::new("Shopping", "Milk"))
            .await
            .expect("create is not an error")
            .expect("node found after reload");
        let file = store
            .create_file_entity(FileUpload {
                filename: "a.pdf".to_string(),
                mime_type: None,
                bytes: b"%PDF".to_vec(),
            })
            .await
            .expect("upload is not an error")
            .expect("node found after reload");

        assert_eq!(api.count(Op::CreateNote), 1);
        assert_eq!(api.count(Op::UploadFile), 1);
        assert_eq!(api.count(Op::ListGraphNodes), 2);
        assert_eq!(node.data.label(), "Shopping");
        assert_eq!(file.key.kind, NodeKind::File);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(
            snapshot.last_note_created.map(|signal| signal.id),
            Some(node.data.back_reference())
        );
        assert_eq!(
            snapshot.last_file_uploaded.map(|signal| signal.id),
            Some(file.data.back_reference())
        );
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn create_without_graph_node_survives_failed_reload() {
        let api = Arc::new(FakeGraphApi::new());
        api.hide_graph_node_ids();
        api.fail_next(Op::ListGraphNodes, server_error());
        let store = store_with(&api);

        let node = store
            .create_note_entity(NoteCreate::new("x", "y"))
            .await
            .expect("create is not an error");

        assert!(node.is_none());
        let snapshot = store.snapshot();
        assert!(snapshot.last_note_created.is_some());
        assert!(snapshot.error.is_some());
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn loading_stays_set_until_last_fetch_finishes() {
        let api = Arc::new(FakeGraphApi::new());
        let store = store_with(&api);
        let gate = api.hold_next(Op::ListGraphNodes);

        let held = store.fetch_graph_data();
        let quick = async {
            tokio::task::yield_now().await;
            store.fetch_graph_data().await.expect("quick fetch");
            store.snapshot().loading
        };
        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_one();
        };
        let (held, loading_after_quick, ()) = tokio::join!(held, quick, release);

        held.expect("held fetch");
        assert!(loading_after_quick);
        assert!(!store.snapshot().loading);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_graph() {
        let api = Arc::new(FakeGraphApi::new());
        api.seed_note("kept", "", None);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        api.fail_next(Op::ListGraphEdges, ApiError::Transport("connection refused".into()));
        store.fetch_graph_data().await.expect_err("must fail");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(!snapshot.loading);
        assert!(
            snapshot
                .error
                .as_deref()
                .is_some_and(|error| error.contains("connection refused"))
        );
    }

    #[tokio::test]
    async fn fetch_records_edges_with_unknown_endpoints() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("a", "", None);
        let gid = note.graph_node_id.expect("graph node");
        api.seed_edge(gid, 999);
        api.seed_edge(gid, gid);
        let store = store_with(&api);

        store.fetch_graph_data().await.expect("fetch");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.dropped_edges.len(), 1);
        assert!(snapshot.dropped_edges[0].missing_target);
    }

    #[tokio::test]
    async fn add_edge_is_idempotent() {
        let api = Arc::new(FakeGraphApi::new());
        let a = api.seed_note("a", "", None).graph_node_id.expect("gid");
        let b = api.seed_file("b.pdf").graph_node_id.expect("gid");
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        let edge = api.seed_edge(a, b);
        store.add_edge(&edge).expect("add");
        store.add_edge(&edge).expect("add again");
        assert_eq!(store.snapshot().edges.len(), 1);

        let stray = GraphEdge {
            id: 77,
            target_node_id: 4242,
            ..edge
        };
        store.add_edge(&stray).expect_err("unknown endpoint");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.dropped_edges[0].edge_id, 77);
    }

    #[tokio::test]
    async fn removing_a_file_drops_touching_edges() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", None);
        let file = api.seed_file("f.png");
        let other = api.seed_note("other", "", None);
        let (n, f, o) = (
            note.graph_node_id.expect("gid"),
            file.graph_node_id.expect("gid"),
            other.graph_node_id.expect("gid"),
        );
        api.seed_edge(n, f);
        api.seed_edge(f, o);
        let kept = api.seed_edge(n, o);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        store.remove_file_entity(file.id).await.expect("remove");
        let snapshot = store.snapshot();
        assert!(snapshot.node(&CanvasNodeKey::file(f)).is_none());
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].key, CanvasEdgeKey::Confirmed(kept.id));
    }

    #[tokio::test]
    async fn failed_delete_keeps_node() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", None);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");
        api.fail_next(Op::DeleteNote, server_error());

        store.remove_note_entity(note.id).await.expect_err("must fail");
        assert_eq!(store.snapshot().nodes.len(), 1);
    }

    #[tokio::test]
    async fn update_note_content_merges_backend_answer() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "old", None);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        store
            .update_note_content(note.id, "new")
            .await
            .expect("update");
        let snapshot = store.snapshot();
        let key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));
        let data = snapshot.node(&key).and_then(|node| node.data.as_note()).expect("note");
        assert_eq!(data.content.as_deref(), Some("new"));
        assert!(data.updated_at.is_some());

        api.fail_next(Op::UpdateNote, server_error());
        store
            .update_note_content(note.id, "lost")
            .await
            .expect_err("must fail");
        let data = store.snapshot().node(&key).and_then(|node| node.data.as_note()).cloned();
        assert_eq!(data.and_then(|note| note.content).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn update_position_routes_by_node_kind() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", Some(Position::new(10.0, 10.0)));
        let file = api.seed_file("f.txt");
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        let note_key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));
        let file_key = CanvasNodeKey::file(file.graph_node_id.expect("gid"));
        store
            .update_position(&note_key, Position::new(50.0, 60.0))
            .await
            .expect("note position");
        store
            .update_position(&file_key, Position::new(5.0, 6.0))
            .await
            .expect("file position");

        let calls = api.calls();
        assert!(calls.contains(&ApiCall::UpdateNote(
            note.id,
            NoteUpdate::position(Position::new(50.0, 60.0))
        )));
        assert!(calls.contains(&ApiCall::UpdateFilePosition(file.id, Position::new(5.0, 6.0))));

        let snapshot = store.snapshot();
        let moved = snapshot.node(&file_key).expect("file node");
        assert_eq!(moved.position, Position::new(5.0, 6.0));
        assert_eq!(moved.persisted_position, Some(Position::new(5.0, 6.0)));
    }

    #[tokio::test]
    async fn failed_position_update_keeps_visual_position_by_default() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", Some(Position::new(10.0, 10.0)));
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");
        let key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));

        store
            .move_node_locally(&key, Position::new(90.0, 90.0))
            .expect("move");
        api.fail_next(Op::UpdateNote, server_error());
        store
            .update_position(&key, Position::new(90.0, 90.0))
            .await
            .expect_err("must fail");

        let snapshot = store.snapshot();
        let node = snapshot.node(&key).expect("node");
        assert_eq!(node.position, Position::new(90.0, 90.0));
        assert_eq!(node.persisted_position, Some(Position::new(10.0, 10.0)));
    }

    #[tokio::test]
    async fn revert_skips_node_removed_during_save() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", Some(Position::new(10.0, 10.0)));
        let store = GraphStore::with_options(
            api.clone(),
            StoreOptions {
                revert_position_on_failure: true,
                ..StoreOptions::default()
            },
        );
        store.fetch_graph_data().await.expect("fetch");
        let key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));

        api.fail_next(Op::UpdateNote, server_error());
        let gate = api.hold_next(Op::UpdateNote);
        let (saved, ()) = tokio::join!(
            store.update_position(&key, Position::new(90.0, 90.0)),
            async {
                store.remove_note_entity(note.id).await.expect("remove");
                gate.notify_one();
            },
        );

        assert!(matches!(saved, Err(StoreError::Api(ApiError::Status { status: 500, .. }))));
        assert!(store.snapshot().nodes.is_empty());
    }

    #[tokio::test]
    async fn failed_position_update_can_revert() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "", Some(Position::new(10.0, 10.0)));
        let store = GraphStore::with_options(
            api.clone(),
            StoreOptions {
                revert_position_on_failure: true,
                ..StoreOptions::default()
            },
        );
        store.fetch_graph_data().await.expect("fetch");
        let key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));

        store
            .move_node_locally(&key, Position::new(90.0, 90.0))
            .expect("move");
        api.fail_next(Op::UpdateNote, server_error());
        store
            .update_position(&key, Position::new(90.0, 90.0))
            .await
            .expect_err("must fail");

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.node(&key).expect("node").position,
            Position::new(10.0, 10.0)
        );
    }

    #[tokio::test]
    async fn created_edge_replaces_pending_one() {
        let api = Arc::new(FakeGraphApi::new());
        let a = api.seed_note("a", "", None).graph_node_id.expect("gid");
        let b = api.seed_file("b").graph_node_id.expect("gid");
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");
        let gate = api.hold_next(Op::CreateEdge);

        let (created, ()) = tokio::join!(
            store.create_edge(CanvasNodeKey::note(a), CanvasNodeKey::file(b), None),
            async {
                let snapshot = store.snapshot();
                assert!(snapshot.edges.is_empty());
                assert_eq!(snapshot.pending_edges.len(), 1);
                assert_eq!(snapshot.pending_edges[0].state, EdgeMutation::Pending);
                assert!(snapshot.pending_edges[0].edge.key.is_pending());
                assert_eq!(snapshot.visible_edges().count(), 1);
                gate.notify_one();
            }
        );

        let created = created.expect("edge");
        let snapshot = store.snapshot();
        assert!(snapshot.pending_edges.is_empty());
        assert_eq!(snapshot.edges, vec![created.clone()]);
        assert_eq!(created.label.as_deref(), Some(DEFAULT_RELATIONSHIP));
    }

    #[tokio::test]
    async fn rejected_edge_leaves_no_trace() {
        let api = Arc::new(FakeGraphApi::new());
        let a = api.seed_note("a", "", None).graph_node_id.expect("gid");
        let b = api.seed_note("b", "", None).graph_node_id.expect("gid");
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");
        api.fail_next(Op::CreateEdge, server_error());

        store
            .create_edge(CanvasNodeKey::note(a), CanvasNodeKey::note(b), None)
            .await
            .expect_err("must fail");
        let snapshot = store.snapshot();
        assert!(snapshot.edges.is_empty());
        assert!(snapshot.pending_edges.is_empty());
        assert!(api.edges().is_empty());
    }

    #[tokio::test]
    async fn create_edge_to_unknown_node_never_calls_backend() {
        let api = Arc::new(FakeGraphApi::new());
        let a = api.seed_note("a", "", None).graph_node_id.expect("gid");
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        let err = store
            .create_edge(CanvasNodeKey::note(a), CanvasNodeKey::file(404), None)
            .await
            .expect_err("must fail");
        assert_eq!(err, StoreError::UnknownNode(CanvasNodeKey::file(404)));
        assert_eq!(api.count(Op::CreateEdge), 0);
    }

    #[tokio::test]
    async fn relabel_and_delete_edge() {
        let api = Arc::new(FakeGraphApi::new());
        let a = api.seed_note("a", "", None).graph_node_id.expect("gid");
        let b = api.seed_note("b", "", None).graph_node_id.expect("gid");
        let edge = api.seed_edge(a, b);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");

        let relabeled = store.relabel_edge(edge.id, "depends on").await.expect("relabel");
        assert_eq!(relabeled.label.as_deref(), Some("depends on"));
        assert_eq!(
            store.snapshot().edge(edge.id).and_then(|edge| edge.label.clone()).as_deref(),
            Some("depends on")
        );

        store.delete_edge(edge.id).await.expect("delete");
        assert!(store.snapshot().edges.is_empty());
        assert!(api.edges().is_empty());
    }

    #[tokio::test]
    async fn concurrent_note_edits_keep_the_last_response() {
        let api = Arc::new(FakeGraphApi::new());
        let note = api.seed_note("n", "start", None);
        let store = store_with(&api);
        store.fetch_graph_data().await.expect("fetch");
        api.delay_next(Op::UpdateNote, Duration::from_millis(50));

        let (slow, fast) = tokio::join!(
            store.update_note_content(note.id, "slow"),
            store.update_note_content(note.id, "fast"),
        );
        slow.expect("slow");
        fast.expect("fast");

        let key = CanvasNodeKey::note(note.graph_node_id.expect("gid"));
        let snapshot = store.snapshot();
        let content = snapshot
            .node(&key)
            .and_then(|node| node.data.as_note())
            .and_then(|note| note.content.clone());
        assert_eq!(content.as_deref(), Some("slow"));
        assert_eq!(api.note(note.id).and_then(|note| note.content).as_deref(), Some("slow"));
    }

    #[tokio::test]
    async fn subscribers_observe_revisions() {
        let api = Arc::new(FakeGraphApi::new());
        let store = store_with(&api);
        let mut revisions = store.subscribe();
        let before = *revisions.borrow_and_update();

        store
            .create_note_entity(NoteCreate::new("a", "b"))
            .await
            .expect("create");
        assert!(revisions.has_changed().expect("sender alive"));
        assert!(*revisions.borrow_and_update() > before);
        assert_eq!(store.snapshot().revision, *revisions.borrow());
    }
}
