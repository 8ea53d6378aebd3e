//! Read side of a contents table.
//!
//! Every read first checks that the named table exists, so a typo in an
//! origin table is a [`PipelineError::NotFound`](crate::error::PipelineError::NotFound)
//! rather than an SQL error halfway through a run.
//!
//! Sampling is done by SQLite, never by loading all rows: `ORDER BY RANDOM()`
//! when no seed is given, or a keyed ordering over `file_id` when one is,
//! which makes the subset reproducible for a given seed and row set.

use sqlx::SqlitePool;

use crate::error::PipelineResult;
use crate::models::{DocumentId, TextRow};
use crate::tables::require_table;

/// Multiplier and modulus of the seeded ordering key.
const SAMPLE_MULTIPLIER: i64 = 2_654_435_761;
const SAMPLE_MODULUS: i64 = 4_294_967_291;

#[derive(Clone)]
pub struct TextRepository {
    pool: SqlitePool,
}

impl TextRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every `(file_id, text_content)` row of `table`.
    pub async fn fetch_all(&self, table: &str) -> PipelineResult<Vec<TextRow>> {
        require_table(&self.pool, table).await?;

        let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
            "SELECT file_id, text_content FROM {} ORDER BY file_id",
            table
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_text_row).collect())
    }

    /// Up to `n` distinct rows of `table`, chosen uniformly at random.
    ///
    /// Returns `min(n, row count)` rows. With `seed` set, the same seed over
    /// the same rows selects the same subset.
    pub async fn fetch_sample(
        &self,
        table: &str,
        n: usize,
        seed: Option<u64>,
    ) -> PipelineResult<Vec<TextRow>> {
        require_table(&self.pool, table).await?;

        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);

        let rows: Vec<(i64, String)> = match seed {
            None => {
                sqlx::query_as(&format!(
                    "SELECT file_id, text_content FROM {} ORDER BY RANDOM() LIMIT ?",
                    table
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(seed) => {
                // SQLite has no XOR operator: (a | b) - (a & b). Both operands
                // stay below 2^31 so the product cannot overflow an i64.
                let key = (seed & 0x7fff_ffff) as i64;
                sqlx::query_as(&format!(
                    r#"
                    SELECT file_id, text_content FROM {table}
                    ORDER BY ((((file_id & 2147483647) | ?) - ((file_id & 2147483647) & ?)) * {mul}) % {modulus}, file_id
                    LIMIT ?
                    "#,
                    table = table,
                    mul = SAMPLE_MULTIPLIER,
                    modulus = SAMPLE_MODULUS
                ))
                .bind(key)
                .bind(key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(into_text_row).collect())
    }

    pub async fn fetch_by_id(
        &self,
        table: &str,
        id: DocumentId,
    ) -> PipelineResult<Option<TextRow>> {
        require_table(&self.pool, table).await?;

        let row: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT file_id, text_content FROM {} WHERE file_id = ?",
            table
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(into_text_row))
    }

    pub async fn count(&self, table: &str) -> PipelineResult<i64> {
        require_table(&self.pool, table).await?;

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn into_text_row((id, text): (i64, String)) -> TextRow {
    TextRow {
        document_id: DocumentId(id),
        text,
    }
}
