//! Conversions from backend records to canvas nodes and edges.

use std::collections::HashMap;

use core_types::{
    CanvasEdge, CanvasEdgeKey, CanvasNode, CanvasNodeKey, EdgeId, FileNodeData, FileRecord,
    GraphEdge, GraphNode, GraphNodeId, NodeData, NodeKind, Note, NoteNodeData, Position,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// An edge that could not be placed on the canvas because one or both of its
/// endpoints are not among the loaded nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedEdge {
    pub edge_id: EdgeId,
    pub source_node_id: GraphNodeId,
    pub target_node_id: GraphNodeId,
    pub missing_source: bool,
    pub missing_target: bool,
}

/// Graph node id to canvas key lookup used when resolving edge endpoints.
pub type NodeIndex = HashMap<GraphNodeId, CanvasNodeKey>;

pub fn index_nodes<'a>(nodes: impl IntoIterator<Item = &'a CanvasNode>) -> NodeIndex {
    nodes
        .into_iter()
        .map(|node| (node.key.id, node.key))
        .collect()
}

pub fn random_position<R: Rng + ?Sized>(bound: f64, rng: &mut R) -> Position {
    let bound = if bound > 0.0 { bound } else { 1.0 };
    Position::new(rng.gen_range(0.0..bound), rng.gen_range(0.0..bound))
}

/// Maps a backend graph node. Returns `None` for unknown node types or when
/// the back-reference to the owning note/file is missing.
pub fn to_canvas_node<R: Rng + ?Sized>(
    node: &GraphNode,
    position_bound: f64,
    rng: &mut R,
) -> Option<CanvasNode> {
    let Some(kind) = node.kind() else {
        warn!(graph_node_id = node.id, node_type = %node.node_type, "skipping node of unknown type");
        return None;
    };
    let Some(back_reference) = node.back_reference() else {
        warn!(
            graph_node_id = node.id,
            %kind,
            "skipping node without back-reference"
        );
        return None;
    };

    let persisted_position = node.stored_position();
    let position = persisted_position.unwrap_or_else(|| random_position(position_bound, rng));
    let label = node.label.clone().unwrap_or_default();

    let data = match kind {
        NodeKind::Note => NodeData::Note(NoteNodeData {
            graph_node_id: node.id,
            original_note_id: back_reference,
            label,
            content: node.data_str("content").map(str::to_string),
            tags: string_list(node.data_value("tags")),
            created_at: node.created_at,
            updated_at: node.updated_at,
        }),
        NodeKind::File => NodeData::File(FileNodeData {
            graph_node_id: node.id,
            original_file_id: back_reference,
            filename: node
                .data_str("filename")
                .map(str::to_string)
                .unwrap_or_else(|| label.clone()),
            label,
            mime_type: node.data_str("mime_type").map(str::to_string),
            size: node.data_value("size").and_then(Value::as_u64),
            created_at: node.created_at,
        }),
    };

    Some(CanvasNode {
        key: CanvasNodeKey::new(kind, node.id),
        position,
        persisted_position,
        data,
    })
}

/// Maps a note returned by the create endpoint. `None` when the backend did
/// not report the graph node it created for the note.
pub fn note_to_canvas_node<R: Rng + ?Sized>(
    note: &Note,
    position_bound: f64,
    rng: &mut R,
) -> Option<CanvasNode> {
    let graph_node_id = note.graph_node_id?;
    let persisted_position = note.position();
    Some(CanvasNode {
        key: CanvasNodeKey::note(graph_node_id),
        position: persisted_position.unwrap_or_else(|| random_position(position_bound, rng)),
        persisted_position,
        data: NodeData::Note(NoteNodeData {
            graph_node_id,
            original_note_id: note.id,
            label: note.title.clone().unwrap_or_default(),
            content: note.content.clone(),
            tags: note.tags.clone().unwrap_or_default(),
            created_at: note.created_at,
            updated_at: note.updated_at,
        }),
    })
}

pub fn file_to_canvas_node<R: Rng + ?Sized>(
    file: &FileRecord,
    position_bound: f64,
    rng: &mut R,
) -> Option<CanvasNode> {
    let graph_node_id = file.graph_node_id?;
    Some(CanvasNode {
        key: CanvasNodeKey::file(graph_node_id),
        position: random_position(position_bound, rng),
        persisted_position: None,
        data: NodeData::File(FileNodeData {
            graph_node_id,
            original_file_id: file.id,
            label: file.filename.clone(),
            filename: file.filename.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size,
            created_at: file.created_at,
        }),
    })
}

pub fn to_canvas_edge(edge: &GraphEdge, known: &NodeIndex) -> Result<CanvasEdge, DroppedEdge> {
    let source = known.get(&edge.source_node_id);
    let target = known.get(&edge.target_node_id);
    match (source, target) {
        (Some(source), Some(target)) => Ok(CanvasEdge {
            key: CanvasEdgeKey::Confirmed(edge.id),
            source: *source,
            target: *target,
            label: edge.relationship_type.clone(),
        }),
        _ => Err(DroppedEdge {
            edge_id: edge.id,
            source_node_id: edge.source_node_id,
            target_node_id: edge.target_node_id,
            missing_source: source.is_none(),
            missing_target: target.is_none(),
        }),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
