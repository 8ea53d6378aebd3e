//! Collection statistics.
//!
//! Provides a quick summary of one collection: how many documents were
//! ingested, how many failed extraction, and how parse runs have gone per
//! schema. Used by `docparse stats` to give confidence that extract and
//! parse runs are doing what is expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::PipelineResult;
use crate::tables::{
    default_destination, require_table, table_exists, validate_table_name, CollectionTables,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    pub documents: i64,
    pub failed_extractions: i64,
    pub text_rows: i64,
    pub total_bytes: i64,
    pub last_processed_at: Option<i64>,
    /// `None` when the parsed-output table does not exist yet.
    pub parsed: Option<ParsedStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedStats {
    pub table: String,
    pub records: i64,
    pub structured: i64,
    pub failed: i64,
    pub runs: i64,
    pub last_parsed_at: Option<i64>,
    pub by_schema: Vec<SchemaStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaStats {
    pub schema_name: String,
    pub records: i64,
    pub structured: i64,
    pub failed: i64,
}

/// Gather statistics for collection `base` and its parsed table `destination`.
pub async fn collection_stats(
    pool: &SqlitePool,
    base: &str,
    destination: &str,
) -> PipelineResult<CollectionStats> {
    let tables = CollectionTables::new(base)?;
    validate_table_name(destination)?;
    require_table(pool, &tables.metadata).await?;

    let row = sqlx::query(&format!(
        r#"
        SELECT
            COUNT(*) AS documents,
            COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed,
            COALESCE(SUM(file_size), 0) AS total_bytes,
            MAX(processed_at) AS last_processed_at
        FROM {}
        "#,
        tables.metadata
    ))
    .fetch_one(pool)
    .await?;

    let text_rows: i64 = if table_exists(pool, &tables.contents).await? {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", tables.contents))
            .fetch_one(pool)
            .await?
    } else {
        0
    };

    let parsed = if table_exists(pool, destination).await? {
        Some(parsed_stats(pool, destination).await?)
    } else {
        None
    };

    Ok(CollectionStats {
        documents: row.get("documents"),
        failed_extractions: row.get("failed"),
        text_rows,
        total_bytes: row.get("total_bytes"),
        last_processed_at: row.get("last_processed_at"),
        parsed,
    })
}

async fn parsed_stats(pool: &SqlitePool, table: &str) -> PipelineResult<ParsedStats> {
    let totals = sqlx::query(&format!(
        r#"
        SELECT
            COUNT(*) AS records,
            COALESCE(SUM(CASE WHEN parsed_data IS NOT NULL THEN 1 ELSE 0 END), 0) AS structured,
            COUNT(DISTINCT run_id) AS runs,
            MAX(parsed_at) AS last_parsed_at
        FROM {}
        "#,
        table
    ))
    .fetch_one(pool)
    .await?;

    let schema_rows = sqlx::query(&format!(
        r#"
        SELECT
            schema_name,
            COUNT(*) AS records,
            COALESCE(SUM(CASE WHEN parsed_data IS NOT NULL THEN 1 ELSE 0 END), 0) AS structured
        FROM {}
        GROUP BY schema_name
        ORDER BY records DESC, schema_name
        "#,
        table
    ))
    .fetch_all(pool)
    .await?;

    let by_schema = schema_rows
        .iter()
        .map(|row| {
            let records: i64 = row.get("records");
            let structured: i64 = row.get("structured");
            SchemaStats {
                schema_name: row.get("schema_name"),
                records,
                structured,
                failed: records - structured,
            }
        })
        .collect();

    let records: i64 = totals.get("records");
    let structured: i64 = totals.get("structured");

    Ok(ParsedStats {
        table: table.to_string(),
        records,
        structured,
        failed: records - structured,
        runs: totals.get("runs"),
        last_parsed_at: totals.get("last_parsed_at"),
        by_schema,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, table: &str, destination: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;

    let destination = destination
        .map(str::to_string)
        .unwrap_or_else(|| default_destination(table));
    let stats = collection_stats(&pool, table, &destination).await?;

    println!("Collection: {}", table);
    println!("================================");
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  With text:   {}", stats.text_rows);
    println!("  Failed:      {}", stats.failed_extractions);
    println!("  Source size: {}", format_bytes(stats.total_bytes.max(0) as u64));
    println!(
        "  Last intake: {}",
        stats
            .last_processed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    match &stats.parsed {
        None => {
            println!();
            println!("  {}: not parsed yet", destination);
        }
        Some(parsed) => {
            println!();
            println!("  Parsed ({}):", parsed.table);
            println!("    Records:    {}", parsed.records);
            println!("    Structured: {}", parsed.structured);
            println!("    Failed:     {}", parsed.failed);
            println!("    Runs:       {}", parsed.runs);
            println!(
                "    Last parse: {}",
                parsed
                    .last_parsed_at
                    .map(format_ts_relative)
                    .unwrap_or_else(|| "never".to_string())
            );

            if !parsed.by_schema.is_empty() {
                println!();
                println!(
                    "  {:<32} {:>8} {:>10} {:>8}",
                    "SCHEMA", "RECORDS", "STRUCTURED", "FAILED"
                );
                println!("  {}", "-".repeat(62));
                for s in &parsed.by_schema {
                    println!(
                        "  {:<32} {:>8} {:>10} {:>8}",
                        s.schema_name, s.records, s.structured, s.failed
                    );
                }
            }
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
