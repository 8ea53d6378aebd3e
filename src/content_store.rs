//! Fingerprinted document intake.
//!
//! [`ContentStore::ingest`] is idempotent on raw bytes: the SHA-256 of the
//! bytes is the deduplication key, and a known fingerprint returns the
//! existing [`DocumentId`] without extracting again or writing anything.
//!
//! For a new document the extraction collaborator runs first, outside any
//! transaction. The metadata row and (on success) the contents row are
//! then written in one transaction per document, so a reader sees either
//! nothing or a document whose extraction outcome is already recorded, and
//! a failure on one document never rolls back another.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::extract::{panic_message, ExtractError, TextExtractor};
use crate::models::{DocumentId, IngestOutcome};
use crate::tables::{self, CollectionTables};

/// Hex SHA-256 of a document's raw bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Where a document came from; stored alongside its fingerprint.
#[derive(Debug, Clone)]
pub struct DocumentSource<'a> {
    pub file_name: &'a str,
    pub file_path: &'a str,
    pub content_type: &'a str,
}

pub struct ContentStore {
    pool: SqlitePool,
    tables: CollectionTables,
    extractor: Arc<dyn TextExtractor>,
    max_extract_bytes: u64,
}

impl ContentStore {
    /// Open the collection `base`, creating its tables if needed.
    pub async fn open(
        pool: SqlitePool,
        base: &str,
        extractor: Arc<dyn TextExtractor>,
        max_extract_bytes: u64,
    ) -> PipelineResult<Self> {
        let tables = tables::ensure_collection_tables(&pool, base).await?;
        Ok(Self {
            pool,
            tables,
            extractor,
            max_extract_bytes,
        })
    }

    pub fn tables(&self) -> &CollectionTables {
        &self.tables
    }

    /// Look up a document by fingerprint.
    pub async fn find_by_fingerprint(&self, checksum: &str) -> PipelineResult<Option<DocumentId>> {
        let id: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE checksum = ?",
            self.tables.metadata
        ))
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(DocumentId))
    }

    /// Ingest one document.
    ///
    /// Extraction failures are reported in the returned outcome; only
    /// database errors come back as `Err`.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        source: DocumentSource<'_>,
    ) -> PipelineResult<IngestOutcome> {
        let checksum = fingerprint(bytes);

        if let Some(id) = self.find_by_fingerprint(&checksum).await? {
            debug!(file = source.file_name, %id, "duplicate fingerprint, skipping");
            return Ok(IngestOutcome::Duplicate(id));
        }

        let extraction = self.run_extractor(bytes, source.content_type).await;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let (success, error_message) = match &extraction {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        let insert = sqlx::query(&format!(
            r#"
            INSERT INTO {} (file_name, file_path, file_size, content_type, checksum, success, error_message, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(checksum) DO NOTHING
            "#,
            self.tables.metadata
        ))
        .bind(source.file_name)
        .bind(source.file_path)
        .bind(bytes.len() as i64)
        .bind(source.content_type)
        .bind(&checksum)
        .bind(success)
        .bind(&error_message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if insert.rows_affected() == 0 {
            // Another writer committed the same bytes between lookup and insert.
            tx.rollback().await?;
            let id = self
                .find_by_fingerprint(&checksum)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            return Ok(IngestOutcome::Duplicate(id));
        }

        let id = DocumentId(insert.last_insert_rowid());

        match extraction {
            Ok(text) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (file_id, text_content, extracted_at) VALUES (?, ?, ?)",
                    self.tables.contents
                ))
                .bind(id.0)
                .bind(&text)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                info!(file = source.file_name, %id, chars = text.len(), "ingested");
                Ok(IngestOutcome::Ingested(id))
            }
            Err(e) => {
                tx.commit().await?;

                warn!(file = source.file_name, %id, error = %e, "text extraction failed");
                Ok(IngestOutcome::ExtractionFailed {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run_extractor(&self, bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
        let size = bytes.len() as u64;
        if size > self.max_extract_bytes {
            return Err(ExtractError::TooLarge {
                size,
                limit: self.max_extract_bytes,
            });
        }

        let extractor = Arc::clone(&self.extractor);
        let bytes = bytes.to_vec();
        let content_type = content_type.to_string();

        match tokio::task::spawn_blocking(move || extractor.extract(&bytes, &content_type)).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(ExtractError::Crashed(panic_message(
                join_err.into_panic().as_ref(),
            ))),
            Err(join_err) => Err(ExtractError::Crashed(join_err.to_string())),
        }
    }

    pub async fn document_count(&self) -> PipelineResult<i64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.metadata))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn text_count(&self) -> PipelineResult<i64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.contents))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
