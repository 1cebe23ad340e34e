//! Vector store adapter over SQLite.
//!
//! Owns the `chunks` and `chunk_vectors` tables: callers never touch those
//! tables directly. Mutations are serialized per document with internal async
//! locks, so a delete can never interleave with a stale upsert from an
//! earlier job for the same document. Similarity queries run cosine ranking
//! in Rust over the candidate rows, scoped by owner and/or conversation.
//!
//! Every sqlx failure surfaces as [`PipelineError::StoreUnavailable`], which
//! the queue retries and the retriever degrades on.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::{Chunk, RetrievalResult};

/// Conjunction of scope predicates for a similarity query.
///
/// `None` fields match everything; set fields must all match.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    pub owner: Option<String>,
    pub conversation: Option<String>,
}

pub struct VectorStore {
    pool: SqlitePool,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store or replace the vector and metadata for one chunk.
    ///
    /// Idempotent on `(document_id, chunk_index)`: re-upserting the same
    /// chunk replaces the stored text and vector wholesale.
    pub async fn upsert(
        &self,
        chunk: &Chunk,
        embedding: &[f32],
        model: &str,
    ) -> Result<(), PipelineError> {
        let lock = self.document_lock(&chunk.document_id).await;
        let _guard = lock.lock().await;

        let now = chrono::Utc::now().timestamp();
        let blob = vec_to_blob(embedding);

        let mut tx = self.pool.begin().await?;

        // A chunk re-derived at the same index gets a fresh id; drop the
        // old row (and its vector) before inserting.
        let old_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE document_id = ? AND chunk_index = ?",
        )
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(old_id) = old_id {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(&old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(&old_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, char_len, hash) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.char_len)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(model)
        .bind(embedding.len() as i64)
        .bind(&blob)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove chunks at `first_stale_index` and above, left over from a
    /// previous chunking of the document that produced more chunks than the
    /// current one.
    pub async fn prune_chunks_from(
        &self,
        document_id: &str,
        first_stale_index: i64,
    ) -> Result<(), PipelineError> {
        let lock = self.document_lock(document_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE document_id = ? AND chunk_id IN ( \
                 SELECT id FROM chunks WHERE document_id = ? AND chunk_index >= ? \
             )",
        )
        .bind(document_id)
        .bind(document_id)
        .bind(first_stale_index)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND chunk_index >= ?")
            .bind(document_id)
            .bind(first_stale_index)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove all chunks and vectors for a document in one transaction.
    ///
    /// Atomic from the caller's perspective: concurrent readers see either
    /// all of the document's chunks or none of them.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<(), PipelineError> {
        let lock = self.document_lock(document_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return up to `k` nearest chunks to `vector`, restricted to `filter`.
    ///
    /// Results are sorted most-similar first; equal scores break ties by
    /// lowest chunk index, then lowest document id, for reproducibility.
    pub async fn query(
        &self,
        vector: &[f32],
        filter: &ScopeFilter,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding,
                   c.chunk_index, c.text,
                   d.file_name
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE (? IS NULL OR d.owner_id = ?)
              AND (? IS NULL OR d.conversation_id = ?)
            "#,
        )
        .bind(&filter.owner)
        .bind(&filter.owner)
        .bind(&filter.conversation)
        .bind(&filter.conversation)
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<RetrievalResult> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                let score = cosine_similarity(vector, &stored) as f64;
                RetrievalResult {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    file_name: row.get("file_name"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score,
                }
            })
            .collect();

        results.sort_by(rank_ordering);
        results.truncate(k);

        Ok(results)
    }

    /// Count stored vectors for a document (diagnostics).
    pub async fn vector_count(&self, document_id: &str) -> Result<i64, PipelineError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        // Entries nobody holds anymore (strong count 1: the map's own Arc)
        // are dead; drop them so the map stays bounded by in-flight work.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Ordering for ranked results: score descending, then chunk index
/// ascending, then document id ascending.
fn rank_ordering(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.chunk_index.cmp(&b.chunk_index))
        .then(a.document_id.cmp(&b.document_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc: &str, index: i64, score: f64) -> RetrievalResult {
        RetrievalResult {
            chunk_id: format!("{}-{}", doc, index),
            document_id: doc.to_string(),
            file_name: "f.txt".to_string(),
            chunk_index: index,
            text: String::new(),
            score,
        }
    }

    #[test]
    fn test_rank_ordering_by_score() {
        let mut results = vec![result("d1", 0, 0.2), result("d2", 0, 0.9), result("d3", 0, 0.5)];
        results.sort_by(rank_ordering);
        let docs: Vec<&str> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(docs, vec!["d2", "d3", "d1"]);
    }

    async fn bare_store() -> VectorStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        VectorStore::new(pool)
    }

    #[tokio::test]
    async fn test_idle_document_locks_are_evicted() {
        let store = bare_store().await;
        for i in 0..100 {
            let lock = store.document_lock(&format!("doc-{}", i)).await;
            drop(lock);
        }
        // Each call evicts the previous, now-idle entries.
        let locks = store.doc_locks.lock().await;
        assert!(locks.len() <= 1);
    }

    #[tokio::test]
    async fn test_held_document_lock_survives_eviction() {
        let store = bare_store().await;
        let held = store.document_lock("busy").await;
        let _other = store.document_lock("other").await;

        let locks = store.doc_locks.lock().await;
        assert!(locks.contains_key("busy"));
        drop(locks);
        drop(held);
    }

    #[test]
    fn test_tie_break_chunk_index_then_document_id() {
        let mut results = vec![
            result("d2", 3, 0.5),
            result("d1", 3, 0.5),
            result("d1", 1, 0.5),
        ];
        results.sort_by(rank_ordering);
        let keys: Vec<(i64, &str)> = results
            .iter()
            .map(|r| (r.chunk_index, r.document_id.as_str()))
            .collect();
        assert_eq!(keys, vec![(1, "d1"), (3, "d1"), (3, "d2")]);
    }
}
