pub mod mapper;
pub mod search;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use mapper::{
    DroppedEdge, NodeIndex, file_to_canvas_node, note_to_canvas_node, to_canvas_edge,
    to_canvas_node,
};
pub use search::{Answer, SearchHits, highlight_keys};
pub use store::{
    DEFAULT_RELATIONSHIP, EdgeMutation, EntitySignal, GraphSnapshot, GraphStore, PendingEdge,
    StoreError, StoreOptions, StoreResult,
};
