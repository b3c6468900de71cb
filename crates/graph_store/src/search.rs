use std::collections::BTreeSet;

use core_types::{CanvasNode, CanvasNodeKey, NoteId, RagAnswer, SearchResponse};
use tracing::debug;

use crate::store::{GraphStore, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHits {
    pub response: SearchResponse,
    /// Canvas nodes of the notes that matched, in canvas order.
    pub highlighted: Vec<CanvasNodeKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub answer: RagAnswer,
    pub highlighted: Vec<CanvasNodeKey>,
}

/// Keys of the note nodes whose `original_note_id` is in `note_ids`.
pub fn highlight_keys(
    nodes: &[CanvasNode],
    note_ids: impl IntoIterator<Item = NoteId>,
) -> Vec<CanvasNodeKey> {
    let wanted: BTreeSet<NoteId> = note_ids.into_iter().collect();
    nodes
        .iter()
        .filter_map(|node| {
            let note = node.data.as_note()?;
            wanted
                .contains(&note.original_note_id)
                .then_some(node.key)
        })
        .collect()
}

impl GraphStore {
    pub async fn search_notes(&self, query: &str, top_k: u32) -> StoreResult<SearchHits> {
        let response = self.api().search_notes(query, top_k).await?;
        let snapshot = self.snapshot();
        let highlighted = highlight_keys(
            &snapshot.nodes,
            response.results.iter().filter_map(|found| found.note_id()),
        );
        debug!(
            results = response.results.len(),
            highlighted = highlighted.len(),
            "note search finished"
        );
        Ok(SearchHits {
            response,
            highlighted,
        })
    }

    pub async fn ask(&self, query: &str) -> StoreResult<Answer> {
        let answer = self.api().rag_query(query).await?;
        let highlighted = highlight_keys(
            &self.snapshot().nodes,
            answer.sources.iter().filter_map(|source| source.note_id),
        );
        Ok(Answer {
            answer,
            highlighted,
        })
    }
}
