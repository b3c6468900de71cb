use async_trait::async_trait;
use thiserror::Error;

use crate::canvas::Position;
use crate::keys::{EdgeId, FileId, NoteId};
use crate::records::{
    FileRecord, FileUpload, GraphEdge, GraphEdgeCreate, GraphEdgeUpdate, GraphNode, Note,
    NoteCreate, NoteUpdate, Page, RagAnswer, SearchResponse,
};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("backend responded {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Supplies the bearer token attached to outgoing requests, if any.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Remote notes/files/graph backend as seen by the graph store.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn list_graph_nodes(&self) -> ApiResult<Vec<GraphNode>>;
    async fn list_graph_edges(&self) -> ApiResult<Vec<GraphEdge>>;

    async fn list_notes(&self, skip: u32, limit: u32) -> ApiResult<Page<Note>>;
    async fn create_note(&self, note: &NoteCreate) -> ApiResult<Note>;
    async fn update_note(&self, note_id: NoteId, update: &NoteUpdate) -> ApiResult<Note>;
    async fn delete_note(&self, note_id: NoteId) -> ApiResult<()>;

    async fn list_files(&self, skip: u32, limit: u32) -> ApiResult<Page<FileRecord>>;
    async fn upload_file(&self, upload: FileUpload) -> ApiResult<FileRecord>;
    async fn update_file_position(&self, file_id: FileId, position: Position)
    -> ApiResult<GraphNode>;
    async fn delete_file(&self, file_id: FileId) -> ApiResult<()>;
    async fn download_file(&self, file_id: FileId) -> ApiResult<Vec<u8>>;

    async fn create_edge(&self, edge: &GraphEdgeCreate) -> ApiResult<GraphEdge>;
    async fn update_edge(&self, edge_id: EdgeId, update: &GraphEdgeUpdate)
    -> ApiResult<GraphEdge>;
    async fn delete_edge(&self, edge_id: EdgeId) -> ApiResult<()>;

    async fn search_notes(&self, query: &str, top_k: u32) -> ApiResult<SearchResponse>;
    async fn rag_query(&self, query: &str) -> ApiResult<RagAnswer>;
}
