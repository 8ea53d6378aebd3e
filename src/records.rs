//! Parsed-record persistence.
//!
//! One row per structuring attempt, written in its own transaction. A
//! failed attempt still gets a row: `parsed_data` is NULL exactly when
//! the outcome was `Failed`, and `failure_reason` says why.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::PipelineResult;
use crate::models::DocumentId;
use crate::structuring::ParseOutcome;
use crate::tables::validate_table_name;

/// A row of a parsed-output table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ParsedRecord {
    pub id: i64,
    pub file_id: i64,
    pub schema_name: String,
    pub parsed_data: Option<String>,
    pub failure_reason: Option<String>,
    pub run_id: String,
    pub parsed_at: i64,
}

pub async fn insert_parsed_record(
    pool: &SqlitePool,
    destination: &str,
    document: DocumentId,
    schema_name: &str,
    outcome: &ParseOutcome,
    run_id: &str,
) -> PipelineResult<i64> {
    validate_table_name(destination)?;

    let payload = outcome.payload().map(|value| value.to_string());
    let failure = outcome.failure().map(|reason| reason.to_string());

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&format!(
        r#"
        INSERT INTO {} (file_id, schema_name, parsed_data, failure_reason, run_id, parsed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        destination
    ))
    .bind(document.0)
    .bind(schema_name)
    .bind(&payload)
    .bind(&failure)
    .bind(run_id)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(result.last_insert_rowid())
}

/// Records of one document in `destination`, oldest first.
pub async fn records_for_document(
    pool: &SqlitePool,
    destination: &str,
    document: DocumentId,
) -> PipelineResult<Vec<ParsedRecord>> {
    validate_table_name(destination)?;

    let records = sqlx::query_as::<_, ParsedRecord>(&format!(
        "SELECT id, file_id, schema_name, parsed_data, failure_reason, run_id, parsed_at \
         FROM {} WHERE file_id = ? ORDER BY id",
        destination
    ))
    .bind(document.0)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Records written by one parse run, in insertion order.
pub async fn records_for_run(
    pool: &SqlitePool,
    destination: &str,
    run_id: &str,
) -> PipelineResult<Vec<ParsedRecord>> {
    validate_table_name(destination)?;

    let records = sqlx::query_as::<_, ParsedRecord>(&format!(
        "SELECT id, file_id, schema_name, parsed_data, failure_reason, run_id, parsed_at \
         FROM {} WHERE run_id = ? ORDER BY id",
        destination
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structuring::FailureReason;
    use crate::tables::ensure_parsed_table;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn pool_with_destination(tmp: &TempDir) -> SqlitePool {
        let url = format!("sqlite:{}?mode=rwc", tmp.path().join("t.sqlite").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        ensure_parsed_table(&pool, "docs_parsed").await.unwrap();
        pool
    }

    #[tokio::test]
    async fn payload_is_null_iff_failed() {
        let tmp = TempDir::new().unwrap();
        let pool = pool_with_destination(&tmp).await;

        let ok = ParseOutcome::Structured(json!({"name": "Jane"}));
        let failed = ParseOutcome::Failed(FailureReason::EmptyText);
        insert_parsed_record(&pool, "docs_parsed", DocumentId(1), "member", &ok, "run-1")
            .await
            .unwrap();
        insert_parsed_record(&pool, "docs_parsed", DocumentId(2), "member", &failed, "run-1")
            .await
            .unwrap();

        let records = records_for_run(&pool, "docs_parsed", "run-1").await.unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].schema_name, "member");
        let data: serde_json::Value =
            serde_json::from_str(records[0].parsed_data.as_deref().unwrap()).unwrap();
        assert_eq!(data, json!({"name": "Jane"}));
        assert!(records[0].failure_reason.is_none());

        assert!(records[1].parsed_data.is_none());
        assert_eq!(records[1].failure_reason.as_deref(), Some("document has no text"));
    }

    #[tokio::test]
    async fn reparsing_appends_rows() {
        let tmp = TempDir::new().unwrap();
        let pool = pool_with_destination(&tmp).await;
        let ok = ParseOutcome::Structured(json!({"name": "Jane"}));

        for run in ["run-1", "run-2"] {
            insert_parsed_record(&pool, "docs_parsed", DocumentId(7), "member", &ok, run)
                .await
                .unwrap();
        }

        let records = records_for_document(&pool, "docs_parsed", DocumentId(7))
            .await
            .unwrap();
        let runs: Vec<&str> = records.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(runs, vec!["run-1", "run-2"]);
    }
}
