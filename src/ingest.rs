//! Ingestion pipeline: the work behind queue jobs.
//!
//! Coordinates chunking → embedding → vector storage for one document per
//! job, plus document registration and deletion. Failures bubble up as
//! [`PipelineError`] so the queue can decide between retry and fail.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding;
use crate::error::PipelineError;
use crate::models::{Document, Job, JobKind, NewDocument};
use crate::queue::JobExecutor;
use crate::store::VectorStore;

pub struct IngestPipeline {
    pool: SqlitePool,
    store: Arc<VectorStore>,
    config: Arc<Config>,
}

impl IngestPipeline {
    pub fn new(pool: SqlitePool, store: Arc<VectorStore>, config: Arc<Config>) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    /// Insert the document row. Must happen before an ingest job is
    /// enqueued; the job only carries the document id.
    pub async fn register_document(&self, new: NewDocument) -> Result<Document, PipelineError> {
        if new.body.is_empty() {
            return Err(PipelineError::InvalidInput(
                "document body is empty".to_string(),
            ));
        }
        if new.owner_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "owner_id must not be empty".to_string(),
            ));
        }

        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id,
            conversation_id: new.conversation_id,
            file_name: new.file_name,
            content_type: new.content_type,
            size: new.body.len() as i64,
            body: new.body,
            created_at: Utc::now().timestamp(),
        };

        sqlx::query(
            "INSERT INTO documents (id, owner_id, conversation_id, file_name, content_type, body, size, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.conversation_id)
        .bind(&doc.file_name)
        .bind(&doc.content_type)
        .bind(&doc.body)
        .bind(doc.size)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    /// Chunk, embed, and index one registered document.
    ///
    /// Idempotent: re-running replaces each chunk's text and vector
    /// wholesale at the same `(document_id, chunk_index)` slots, and drops
    /// any higher-index chunks left over from a previous run.
    pub async fn ingest_document(&self, document_id: &str) -> Result<(), PipelineError> {
        let doc = fetch_document(&self.pool, document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))?;

        if !self.config.embedding.is_enabled() {
            return Err(PipelineError::InvalidInput(
                "embedding provider is disabled; cannot ingest documents".to_string(),
            ));
        }

        let chunks = chunk_document(&doc.id, &doc.body, &self.config.chunking)?;
        let provider = embedding::create_provider(&self.config.embedding)?;
        let model = provider.model_name().to_string();

        let mut stored = 0usize;
        for batch in chunks.chunks(self.config.embedding.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors =
                embedding::embed_texts(provider.as_ref(), &self.config.embedding, &texts).await?;

            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                self.store.upsert(chunk, vector, &model).await?;
                stored += 1;
            }
        }

        // A previous ingest with a different chunking config may have left
        // chunks beyond the current count; they must not stay retrievable.
        self.store
            .prune_chunks_from(&doc.id, chunks.len() as i64)
            .await?;

        info!(
            document_id,
            chunks = stored,
            file_name = %doc.file_name,
            "document ingested"
        );
        Ok(())
    }

    /// Remove a document's vectors, chunks, and finally its row.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), PipelineError> {
        self.store.delete_by_document(document_id).await?;

        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        debug!(document_id, "document deleted");
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for IngestPipeline {
    async fn execute(&self, job: &Job) -> Result<(), PipelineError> {
        match job.kind {
            JobKind::Ingest => self.ingest_document(&job.document_id).await,
            JobKind::Delete => self.delete_document(&job.document_id).await,
        }
    }
}

/// Fetch a document row by id.
pub async fn fetch_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, owner_id, conversation_id, file_name, content_type, body, size, created_at \
         FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        conversation_id: row.get("conversation_id"),
        file_name: row.get("file_name"),
        content_type: row.get("content_type"),
        body: row.get("body"),
        size: row.get("size"),
        created_at: row.get("created_at"),
    }))
}
