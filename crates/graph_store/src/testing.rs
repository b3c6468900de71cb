//! In-memory backend used by store and controller tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use core_types::{
    ApiError, ApiResult, EdgeId, FileId, FileRecord, FileUpload, GraphApi, GraphEdge,
    GraphEdgeCreate, GraphEdgeUpdate, GraphNode, GraphNodeId, Note, NoteCreate, NoteId,
    NoteUpdate, Page, Position, RagAnswer, RagSource, RawPosition, SearchMatch, SearchResponse,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListGraphNodes,
    ListGraphEdges,
    ListNotes,
    CreateNote,
    UpdateNote,
    DeleteNote,
    ListFiles,
    UploadFile,
    UpdateFilePosition,
    DeleteFile,
    DownloadFile,
    CreateEdge,
    UpdateEdge,
    DeleteEdge,
    SearchNotes,
    RagQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    ListGraphNodes,
    ListGraphEdges,
    ListNotes { skip: u32, limit: u32 },
    CreateNote(NoteCreate),
    UpdateNote(NoteId, NoteUpdate),
    DeleteNote(NoteId),
    ListFiles { skip: u32, limit: u32 },
    UploadFile { filename: String },
    UpdateFilePosition(FileId, Position),
    DeleteFile(FileId),
    DownloadFile(FileId),
    CreateEdge(GraphEdgeCreate),
    UpdateEdge(EdgeId, GraphEdgeUpdate),
    DeleteEdge(EdgeId),
    SearchNotes { query: String, top_k: u32 },
    RagQuery(String),
}

impl ApiCall {
    pub fn op(&self) -> Op {
        match self {
            ApiCall::ListGraphNodes => Op::ListGraphNodes,
            ApiCall::ListGraphEdges => Op::ListGraphEdges,
            ApiCall::ListNotes { .. } => Op::ListNotes,
            ApiCall::CreateNote(_) => Op::CreateNote,
            ApiCall::UpdateNote(..) => Op::UpdateNote,
            ApiCall::DeleteNote(_) => Op::DeleteNote,
            ApiCall::ListFiles { .. } => Op::ListFiles,
            ApiCall::UploadFile { .. } => Op::UploadFile,
            ApiCall::UpdateFilePosition(..) => Op::UpdateFilePosition,
            ApiCall::DeleteFile(_) => Op::DeleteFile,
            ApiCall::DownloadFile(_) => Op::DownloadFile,
            ApiCall::CreateEdge(_) => Op::CreateEdge,
            ApiCall::UpdateEdge(..) => Op::UpdateEdge,
            ApiCall::DeleteEdge(_) => Op::DeleteEdge,
            ApiCall::SearchNotes { .. } => Op::SearchNotes,
            ApiCall::RagQuery(_) => Op::RagQuery,
        }
    }
}

#[derive(Default)]
struct Backend {
    next_id: i64,
    notes: Vec<Note>,
    files: Vec<(FileRecord, Vec<u8>)>,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    calls: Vec<ApiCall>,
    failures: HashMap<Op, ApiError>,
    delays: HashMap<Op, Duration>,
    gates: HashMap<Op, Arc<Notify>>,
    hide_graph_node_ids: bool,
}

impl Backend {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_note(&mut self, title: &str, content: Option<&str>, position: Option<Position>) -> Note {
        let id = self.allocate();
        let graph_node_id = self.allocate();
        let now = Utc::now();
        self.nodes.push(GraphNode {
            id: graph_node_id,
            user_id: 1,
            label: Some(title.to_string()),
            node_type: "note".to_string(),
            data: Some(object(json!({
                "original_note_id": id,
                "content": content,
            }))),
            position: position.map(raw_position),
            created_at: now,
            updated_at: None,
        });
        let note = Note {
            id,
            user_id: 1,
            title: Some(title.to_string()),
            content: content.map(str::to_string),
            position_x: position.map(|p| p.x),
            position_y: position.map(|p| p.y),
            graph_node_id: Some(graph_node_id),
            tags: None,
            created_at: now,
            updated_at: None,
        };
        self.notes.push(note.clone());
        note
    }

    fn insert_file(&mut self, filename: &str, mime_type: Option<String>, bytes: Vec<u8>) -> FileRecord {
        let id = self.allocate();
        let graph_node_id = self.allocate();
        let now = Utc::now();
        let size = bytes.len() as u64;
        self.nodes.push(GraphNode {
            id: graph_node_id,
            user_id: 1,
            label: Some(filename.to_string()),
            node_type: "file".to_string(),
            data: Some(object(json!({
                "original_file_id": id,
                "mime_type": mime_type,
                "size": size,
            }))),
            position: None,
            created_at: now,
            updated_at: None,
        });
        let file = FileRecord {
            id,
            user_id: 1,
            filename: filename.to_string(),
            mime_type,
            size: Some(size),
            graph_node_id: Some(graph_node_id),
            created_at: now,
        };
        self.files.push((file.clone(), bytes));
        file
    }

    fn insert_edge(&mut self, source: GraphNodeId, target: GraphNodeId, label: Option<String>) -> GraphEdge {
        let edge = GraphEdge {
            id: self.allocate(),
            user_id: 1,
            source_node_id: source,
            target_node_id: target,
            relationship_type: label,
            data: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.edges.push(edge.clone());
        edge
    }

    fn remove_graph_node(&mut self, graph_node_id: Option<GraphNodeId>) {
        let Some(id) = graph_node_id else {
            return;
        };
        self.nodes.retain(|node| node.id != id);
        self.edges
            .retain(|edge| edge.source_node_id != id && edge.target_node_id != id);
    }

    fn matching_notes(&self, query: &str) -> Vec<&Note> {
        let query = query.to_lowercase();
        self.notes
            .iter()
            .filter(|note| {
                [note.title.as_deref(), note.content.as_deref()]
                    .into_iter()
                    .flatten()
                    .any(|text| text.to_lowercase().contains(&query))
            })
            .collect()
    }
}

/// Records every call, and can fail, delay or hold the next call of a given
/// operation.
#[derive(Default)]
pub struct FakeGraphApi {
    backend: Mutex<Backend>,
}

impl FakeGraphApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_note(&self, title: &str, content: &str, position: Option<Position>) -> Note {
        self.backend.lock().insert_note(title, Some(content), position)
    }

    pub fn seed_file(&self, filename: &str) -> FileRecord {
        self.backend
            .lock()
            .insert_file(filename, None, filename.as_bytes().to_vec())
    }

    pub fn seed_edge(&self, source: GraphNodeId, target: GraphNodeId) -> GraphEdge {
        self.backend
            .lock()
            .insert_edge(source, target, Some("related".to_string()))
    }

    /// Created notes and uploaded files come back without `graph_node_id`,
    /// the way the backend serializes them.
    pub fn hide_graph_node_ids(&self) {
        self.backend.lock().hide_graph_node_ids = true;
    }

    pub fn fail_next(&self, op: Op, err: ApiError) {
        self.backend.lock().failures.insert(op, err);
    }

    pub fn delay_next(&self, op: Op, delay: Duration) {
        self.backend.lock().delays.insert(op, delay);
    }

    /// The next call of `op` waits until the returned handle is notified.
    pub fn hold_next(&self, op: Op) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.backend.lock().gates.insert(op, gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.backend.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.backend
            .lock()
            .calls
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    pub fn note(&self, note_id: NoteId) -> Option<Note> {
        self.backend
            .lock()
            .notes
            .iter()
            .find(|note| note.id == note_id)
            .cloned()
    }

    pub fn edges(&self) -> Vec<GraphEdge> {
        self.backend.lock().edges.clone()
    }

    async fn enter(&self, call: ApiCall) -> ApiResult<()> {
        let op = call.op();
        let (gate, delay, failure) = {
            let mut backend = self.backend.lock();
            backend.calls.push(call);
            (
                backend.gates.remove(&op),
                backend.delays.remove(&op),
                backend.failures.remove(&op),
            )
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GraphApi for FakeGraphApi {
    async fn list_graph_nodes(&self) -> ApiResult<Vec<GraphNode>> {
        self.enter(ApiCall::ListGraphNodes).await?;
        Ok(self.backend.lock().nodes.clone())
    }

    async fn list_graph_edges(&self) -> ApiResult<Vec<GraphEdge>> {
        self.enter(ApiCall::ListGraphEdges).await?;
        Ok(self.backend.lock().edges.clone())
    }

    async fn list_notes(&self, skip: u32, limit: u32) -> ApiResult<Page<Note>> {
        self.enter(ApiCall::ListNotes { skip, limit }).await?;
        let backend = self.backend.lock();
        Ok(Page {
            items: page(&backend.notes, skip, limit),
            total: backend.notes.len() as u64,
        })
    }

    async fn create_note(&self, note: &NoteCreate) -> ApiResult<Note> {
        self.enter(ApiCall::CreateNote(note.clone())).await?;
        let position = note
            .position_x
            .zip(note.position_y)
            .map(|(x, y)| Position::new(x, y));
        let mut backend = self.backend.lock();
        let mut created = backend.insert_note(&note.title, note.content.as_deref(), position);
        if backend.hide_graph_node_ids {
            created.graph_node_id = None;
        }
        Ok(created)
    }

    async fn update_note(&self, note_id: NoteId, update: &NoteUpdate) -> ApiResult<Note> {
        self.enter(ApiCall::UpdateNote(note_id, update.clone())).await?;
        let mut backend = self.backend.lock();
        let note = backend
            .notes
            .iter_mut()
            .find(|note| note.id == note_id)
            .ok_or_else(|| not_found("Note"))?;
        if let Some(title) = &update.title {
            note.title = Some(title.clone());
        }
        if let Some(content) = &update.content {
            note.content = Some(content.clone());
        }
        if update.position_x.is_some() {
            note.position_x = update.position_x;
        }
        if update.position_y.is_some() {
            note.position_y = update.position_y;
        }
        if let Some(tags) = &update.tags {
            note.tags = Some(tags.clone());
        }
        note.updated_at = Some(Utc::now());
        let note = note.clone();

        if let Some(node) = backend
            .nodes
            .iter_mut()
            .find(|node| Some(node.id) == note.graph_node_id)
        {
            node.label = note.title.clone();
            node.position = note.position().map(raw_position);
            let data = node.data.get_or_insert_with(Map::new);
            data.insert("content".to_string(), json!(note.content));
            if let Some(tags) = &note.tags {
                data.insert("tags".to_string(), json!(tags));
            }
            node.updated_at = note.updated_at;
        }
        Ok(note)
    }

    async fn delete_note(&self, note_id: NoteId) -> ApiResult<()> {
        self.enter(ApiCall::DeleteNote(note_id)).await?;
        let mut backend = self.backend.lock();
        let index = backend
            .notes
            .iter()
            .position(|note| note.id == note_id)
            .ok_or_else(|| not_found("Note"))?;
        let note = backend.notes.remove(index);
        backend.remove_graph_node(note.graph_node_id);
        Ok(())
    }

    async fn list_files(&self, skip: u32, limit: u32) -> ApiResult<Page<FileRecord>> {
        self.enter(ApiCall::ListFiles { skip, limit }).await?;
        let backend = self.backend.lock();
        let files: Vec<FileRecord> = backend.files.iter().map(|(file, _)| file.clone()).collect();
        Ok(Page {
            items: page(&files, skip, limit),
            total: files.len() as u64,
        })
    }

    async fn upload_file(&self, upload: FileUpload) -> ApiResult<FileRecord> {
        self.enter(ApiCall::UploadFile {
            filename: upload.filename.clone(),
        })
        .await?;
        let mut backend = self.backend.lock();
        let mut created = backend.insert_file(&upload.filename, upload.mime_type, upload.bytes);
        if backend.hide_graph_node_ids {
            created.graph_node_id = None;
        }
        Ok(created)
    }

    async fn update_file_position(
        &self,
        file_id: FileId,
        position: Position,
    ) -> ApiResult<GraphNode> {
        self.enter(ApiCall::UpdateFilePosition(file_id, position)).await?;
        let mut backend = self.backend.lock();
        let graph_node_id = backend
            .files
            .iter()
            .find(|(file, _)| file.id == file_id)
            .and_then(|(file, _)| file.graph_node_id)
            .ok_or_else(|| not_found("File"))?;
        let node = backend
            .nodes
            .iter_mut()
            .find(|node| node.id == graph_node_id)
            .ok_or_else(|| not_found("Graph node"))?;
        node.position = Some(raw_position(position));
        node.updated_at = Some(Utc::now());
        Ok(node.clone())
    }

    async fn delete_file(&self, file_id: FileId) -> ApiResult<()> {
        self.enter(ApiCall::DeleteFile(file_id)).await?;
        let mut backend = self.backend.lock();
        let index = backend
            .files
            .iter()
            .position(|(file, _)| file.id == file_id)
            .ok_or_else(|| not_found("File"))?;
        let (file, _) = backend.files.remove(index);
        backend.remove_graph_node(file.graph_node_id);
        Ok(())
    }

    async fn download_file(&self, file_id: FileId) -> ApiResult<Vec<u8>> {
        self.enter(ApiCall::DownloadFile(file_id)).await?;
        self.backend
            .lock()
            .files
            .iter()
            .find(|(file, _)| file.id == file_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| not_found("File"))
    }

    async fn create_edge(&self, edge: &GraphEdgeCreate) -> ApiResult<GraphEdge> {
        self.enter(ApiCall::CreateEdge(edge.clone())).await?;
        let mut backend = self.backend.lock();
        for id in [edge.source_node_id, edge.target_node_id] {
            if !backend.nodes.iter().any(|node| node.id == id) {
                return Err(not_found("Graph node"));
            }
        }
        Ok(backend.insert_edge(
            edge.source_node_id,
            edge.target_node_id,
            edge.relationship_type.clone(),
        ))
    }

    async fn update_edge(&self, edge_id: EdgeId, update: &GraphEdgeUpdate) -> ApiResult<GraphEdge> {
        self.enter(ApiCall::UpdateEdge(edge_id, update.clone())).await?;
        let mut backend = self.backend.lock();
        let edge = backend
            .edges
            .iter_mut()
            .find(|edge| edge.id == edge_id)
            .ok_or_else(|| not_found("Edge"))?;
        if update.relationship_type.is_some() {
            edge.relationship_type = update.relationship_type.clone();
        }
        if update.data.is_some() {
            edge.data = update.data.clone();
        }
        edge.updated_at = Some(Utc::now());
        Ok(edge.clone())
    }

    async fn delete_edge(&self, edge_id: EdgeId) -> ApiResult<()> {
        self.enter(ApiCall::DeleteEdge(edge_id)).await?;
        let mut backend = self.backend.lock();
        let before = backend.edges.len();
        backend.edges.retain(|edge| edge.id != edge_id);
        if backend.edges.len() == before {
            return Err(not_found("Edge"));
        }
        Ok(())
    }

    async fn search_notes(&self, query: &str, top_k: u32) -> ApiResult<SearchResponse> {
        self.enter(ApiCall::SearchNotes {
            query: query.to_string(),
            top_k,
        })
        .await?;
        let backend = self.backend.lock();
        let results = backend
            .matching_notes(query)
            .into_iter()
            .take(top_k as usize)
            .map(|note| SearchMatch {
                id: format!("note_{}", note.id),
                score: Some(0.9),
                metadata: object(json!({
                    "note_id": note.id,
                    "title": note.title,
                    "type": "note",
                })),
            })
            .collect();
        Ok(SearchResponse {
            query: query.to_string(),
            results,
        })
    }

    async fn rag_query(&self, query: &str) -> ApiResult<RagAnswer> {
        self.enter(ApiCall::RagQuery(query.to_string())).await?;
        let backend = self.backend.lock();
        let sources: Vec<RagSource> = backend
            .matching_notes(query)
            .into_iter()
            .map(|note| RagSource {
                note_id: Some(note.id),
                title: note.title.clone(),
            })
            .collect();
        Ok(RagAnswer {
            answer: format!("{} notes mention {query}", sources.len()),
            sources,
        })
    }
}

fn page<T: Clone>(items: &[T], skip: u32, limit: u32) -> Vec<T> {
    items
        .iter()
        .skip(skip as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

fn raw_position(position: Position) -> RawPosition {
    RawPosition {
        x: Some(position.x),
        y: Some(position.y),
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        detail: format!("{what} not found"),
    }
}
