//! Qdrant REST search client
//!
//! Only the read path is implemented: the collection is populated by a
//! separate ingestion job.

use serde::{Deserialize, Serialize};

use super::error_from_response;
use crate::error::{Error, Result};

/// A search hit returned by Qdrant
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    /// Point id (integer or UUID string)
    pub id: serde_json::Value,
    /// Similarity score, higher is closer
    pub score: f32,
    /// Stored payload
    #[serde(default)]
    pub payload: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ScoredPoint {
    /// Get a string payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
    }
}

/// Qdrant HTTP client
#[derive(Clone)]
pub struct QdrantClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantClient {
    /// Default REST endpoint of a local Qdrant
    pub const DEFAULT_URL: &'static str = "http://localhost:6333";

    /// Create a client for the given REST endpoint
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Set the API key sent as the `api-key` header
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Use a shared HTTP client
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Nearest-neighbour search, best match first
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        if collection.is_empty() {
            return Err(Error::InvalidConfig("collection name is empty".to_string()));
        }

        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let request = SearchRequest {
            vector,
            limit,
            with_payload: true,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.header("api-key", key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: SearchResponse = response.json().await?;
        tracing::debug!(
            collection,
            hits = body.result.len(),
            "qdrant search completed"
        );
        Ok(sort_by_score(body.result))
    }
}

/// Qdrant already orders by score; sort again so callers can rely on it
fn sort_by_score(mut points: Vec<ScoredPoint>) -> Vec<ScoredPoint> {
    points.sort_by(|a, b| b.score.total_cmp(&a.score));
    points
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}
