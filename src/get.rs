//! Document retrieval by ID.
//!
//! Fetches one document's metadata, its extracted text, and every parsed
//! record written for it. Used by the `docparse get` command.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::PipelineResult;
use crate::models::DocumentId;
use crate::records::{records_for_document, ParsedRecord};
use crate::tables::{
    default_destination, require_table, table_exists, validate_table_name, CollectionTables,
};

#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: i64,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub checksum: String,
    pub extracted: bool,
    pub error_message: Option<String>,
    pub processed_at: String, // ISO8601
    pub text: Option<String>,
    pub records: Vec<ParsedRecord>,
}

/// Look up document `id` of collection `base`, with its records in `destination`.
pub async fn get_document(
    pool: &SqlitePool,
    base: &str,
    id: DocumentId,
    destination: &str,
) -> PipelineResult<Option<DocumentView>> {
    let tables = CollectionTables::new(base)?;
    validate_table_name(destination)?;
    require_table(pool, &tables.metadata).await?;

    let row = sqlx::query(&format!(
        "SELECT id, file_name, file_path, file_size, content_type, checksum, success, error_message, processed_at \
         FROM {} WHERE id = ?",
        tables.metadata
    ))
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let text: Option<String> = if table_exists(pool, &tables.contents).await? {
        sqlx::query_scalar(&format!(
            "SELECT text_content FROM {} WHERE file_id = ?",
            tables.contents
        ))
        .bind(id.0)
        .fetch_optional(pool)
        .await?
    } else {
        None
    };

    let records = if table_exists(pool, destination).await? {
        records_for_document(pool, destination, id).await?
    } else {
        Vec::new()
    };

    let processed_at: i64 = row.get("processed_at");

    Ok(Some(DocumentView {
        id: row.get("id"),
        file_name: row.get("file_name"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        content_type: row.get("content_type"),
        checksum: row.get("checksum"),
        extracted: row.get("success"),
        error_message: row.get("error_message"),
        processed_at: format_ts_iso(processed_at),
        text,
        records,
    }))
}

/// CLI entry point: prints the document to stdout.
pub async fn run_get(
    config: &Config,
    table: &str,
    id: i64,
    destination: Option<&str>,
) -> Result<()> {
    let pool = db::connect(config).await?;

    let destination = destination
        .map(str::to_string)
        .unwrap_or_else(|| default_destination(table));
    let doc = get_document(&pool, table, DocumentId(id), &destination).await?;
    pool.close().await;

    let Some(doc) = doc else {
        bail!("document not found: {} in {}", id, table);
    };

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("file_name:    {}", doc.file_name);
    println!("file_path:    {}", doc.file_path);
    println!("file_size:    {}", doc.file_size);
    println!("content_type: {}", doc.content_type);
    println!("checksum:     {}", doc.checksum);
    println!("processed_at: {}", doc.processed_at);
    if let Some(ref err) = doc.error_message {
        println!("error:        {}", err);
    }
    println!();

    println!("--- Text ---");
    match doc.text {
        Some(ref text) => println!("{}", text),
        None => println!("(no text extracted)"),
    }
    println!();

    println!("--- Parsed records ({}) ---", doc.records.len());
    for record in &doc.records {
        println!(
            "[record {}] schema={} run={} at={}",
            record.id,
            record.schema_name,
            record.run_id,
            format_ts_iso(record.parsed_at)
        );
        match (&record.parsed_data, &record.failure_reason) {
            (Some(data), _) => println!("{}", data),
            (None, Some(reason)) => println!("failed: {}", reason),
            (None, None) => println!("failed"),
        }
        println!();
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
