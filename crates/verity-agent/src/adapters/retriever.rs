//! Vector search over the forum collection.

use std::sync::Arc;

use async_trait::async_trait;
use verity_ai::providers::{
    EmbeddingProvider,
    qdrant::{QdrantClient, ScoredPoint},
};

use crate::capability::Retriever;
use crate::conversation::Passage;
use crate::error::{Error, Result};

/// Source tag for passages whose payload carries none
pub const DEFAULT_SOURCE: &str = "AgnosForum";

/// Passages returned per query unless configured otherwise
pub const DEFAULT_TOP_K: usize = 5;

/// Payload keys that may hold the passage text, in lookup order
const CONTENT_KEYS: &[&str] = &["page_content", "content", "text"];

/// Embeds the query and searches a Qdrant collection
pub struct QdrantRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    client: QdrantClient,
    collection: String,
    top_k: usize,
}

impl QdrantRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        client: QdrantClient,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embedder,
            client,
            collection: collection.into(),
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Set the result-count cap
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

#[async_trait]
impl Retriever for QdrantRetriever {
    async fn search(&self, query: &str) -> Result<Vec<Passage>> {
        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Retrieval("embedding service returned no vector".into()))?;

        let points = self
            .client
            .search(&self.collection, &vector, self.top_k)
            .await?;

        let total = points.len();
        let passages: Vec<Passage> = points.iter().filter_map(passage_from_point).collect();
        if passages.len() < total {
            tracing::warn!(
                collection = %self.collection,
                skipped = total - passages.len(),
                "search hits without passage text"
            );
        }
        Ok(passages)
    }
}

/// Read a passage out of a search hit.
///
/// Accepts both a flat payload and the `metadata` object written by common
/// ingestion tools. Hits without text are dropped.
fn passage_from_point(point: &ScoredPoint) -> Option<Passage> {
    let content = CONTENT_KEYS
        .iter()
        .find_map(|key| point.payload_str(key))
        .filter(|text| !text.trim().is_empty())?;

    let source = point
        .payload_str("source")
        .or_else(|| {
            point
                .payload
                .as_ref()
                .and_then(|p| p.get("metadata"))
                .and_then(|m| m.get("source"))
                .and_then(|s| s.as_str())
        })
        .unwrap_or(DEFAULT_SOURCE);

    Some(Passage::new(content, source))
}
