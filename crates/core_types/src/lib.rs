pub mod api;
pub mod canvas;
pub mod keys;
pub mod records;
pub mod timestamp;

use serde::{Deserialize, Serialize};

pub use api::{ApiError, ApiResult, GraphApi, TokenSource};
pub use canvas::{
    CanvasEdge, CanvasNode, FileNodeData, NodeData, NodePatch, NoteNodeData, Position,
};
pub use keys::{
    CanvasEdgeKey, CanvasNodeKey, EdgeId, FileId, GraphNodeId, KeyParseError, NodeKind, NoteId,
};
pub use records::{
    AccessToken, FilePositionUpdate, FileRecord, FileUpload, GraphEdge, GraphEdgeCreate,
    GraphEdgeUpdate, GraphNode, Note, NoteCreate, NoteUpdate, Page, RagAnswer, RagSource,
    RawPosition, SearchMatch, SearchResponse, User,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UiLanguage {
    ZhCn,
    EnUs,
}
