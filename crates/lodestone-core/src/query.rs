//! Query path: embed the query, search the collection, resolve hit ids back to
//! filename and line range.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::index::{until_cancelled, IndexError};
use crate::ollama::{check_dimension, Embedder};
use crate::store::{
    CollectionPath, ConsistencyLevel, Row, VectorStore, FILENAME_FIELD, ID_FIELD, LINE_END_FIELD,
    LINE_START_FIELD, VECTOR_FIELD,
};

const HIT_FIELDS: [&str; 3] = [FILENAME_FIELD, LINE_START_FIELD, LINE_END_FIELD];

/// A search hit resolved to its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: i64,
    pub score: f32,
    pub filename: String,
    pub line_start: usize,
    pub line_end: usize,
}

pub struct Searcher {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    target: CollectionPath,
    dimension: usize,
    cancel: CancellationToken,
}

impl Searcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        target: CollectionPath,
        dimension: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            target,
            dimension,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon the embed and store calls of a search once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Top `top_k` chunks for `query`, in the store's ranking order. The collection
    /// is loaded for the search and released afterwards, also on failure. A
    /// cancelled search skips the release.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Hit>, IndexError> {
        tracing::debug!(query, "embedding query");
        let vector = until_cancelled(&self.cancel, self.embedder.embed(query)).await?;
        check_dimension(&vector, self.dimension)?;

        tracing::debug!(collection = %self.target, "loading collection");
        until_cancelled(&self.cancel, self.store.load_collection(&self.target)).await?;
        let hits = self.search_loaded(vector, top_k).await;
        let released =
            until_cancelled(&self.cancel, self.store.release_collection(&self.target)).await;
        let hits = hits?;
        released?;
        Ok(hits)
    }

    async fn search_loaded(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<Hit>, IndexError> {
        let queries = [vector];
        let results = until_cancelled(
            &self.cancel,
            self.store.search(&self.target, VECTOR_FIELD, &queries, top_k),
        )
        .await?;

        let mut hits = Vec::new();
        for result in results {
            tracing::debug!(ids = ?result.ids, scores = ?result.scores, "search results");
            let lookup = self.store.get_by_id(
                &self.target,
                &result.ids,
                &HIT_FIELDS,
                ConsistencyLevel::Strong,
            );
            let rows = until_cancelled(&self.cancel, lookup).await?;
            let by_id: HashMap<i64, Row> = rows
                .into_iter()
                .filter_map(|row| Some((row.get(ID_FIELD)?.as_i64()?, row)))
                .collect();

            for (id, score) in result.ids.iter().zip(&result.scores) {
                match by_id.get(id).and_then(|row| resolve(*id, *score, row)) {
                    Some(hit) => hits.push(hit),
                    None => tracing::warn!(id, "search hit has no matching record"),
                }
            }
        }
        Ok(hits)
    }
}

fn resolve(id: i64, score: f32, row: &Row) -> Option<Hit> {
    let line = |field: &str| {
        row.get(field)?
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
    };
    Some(Hit {
        id,
        score,
        filename: row.get(FILENAME_FIELD)?.as_str()?.to_string(),
        line_start: line(LINE_START_FIELD)?,
        line_end: line(LINE_END_FIELD)?,
    })
}
