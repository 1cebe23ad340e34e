//! Best-effort similarity retrieval for chat turns.
//!
//! Embeds the user's query and asks the vector store for the nearest chunks
//! within the caller's scope. Retrieval is an enhancement, never a blocking
//! dependency: any failure along the way (provider down, store unreachable)
//! degrades to an empty result set and the chat turn proceeds without
//! context.

use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::embedding;
use crate::models::RetrievalResult;
use crate::store::{ScopeFilter, VectorStore};

pub struct Retriever {
    store: Arc<VectorStore>,
    config: Arc<Config>,
}

impl Retriever {
    pub fn new(store: Arc<VectorStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Return up to `k` chunks relevant to `query` within `filter`,
    /// most similar first. Infallible by design: degraded dependencies
    /// yield an empty set, logged at WARN.
    pub async fn retrieve(
        &self,
        query: &str,
        filter: &ScopeFilter,
        k: usize,
    ) -> Vec<RetrievalResult> {
        if query.trim().is_empty() || !self.config.embedding.is_enabled() {
            return Vec::new();
        }

        let provider = match embedding::create_provider(&self.config.embedding) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "embedding provider unavailable, retrieval degraded");
                return Vec::new();
            }
        };

        let query_vec =
            match embedding::embed_query(provider.as_ref(), &self.config.embedding, query).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "query embedding failed, retrieval degraded");
                    return Vec::new();
                }
            };

        match self.store.query(&query_vec, filter, k).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "vector store query failed, retrieval degraded");
                Vec::new()
            }
        }
    }

    /// The configured default `k` for chat turns.
    pub fn default_k(&self) -> usize {
        self.config.retrieval.top_k
    }
}
