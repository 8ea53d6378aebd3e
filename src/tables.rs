//! Table naming and creation.
//!
//! A collection is three dependent tables named from one base identifier:
//! `{base}_metadata`, `{base}_contents`, and a parsed-output table (by
//! default `{base}_parsed`). Names are interpolated into SQL, so every
//! name is checked by [`validate_table_name`] first.

use sqlx::SqlitePool;

use crate::error::{PipelineError, PipelineResult};

const MAX_TABLE_NAME_LEN: usize = 64;

/// Physical table names of one document collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionTables {
    pub base: String,
    pub metadata: String,
    pub contents: String,
}

impl CollectionTables {
    pub fn new(base: &str) -> PipelineResult<Self> {
        validate_table_name(base)?;
        let tables = Self {
            base: base.to_string(),
            metadata: format!("{}_metadata", base),
            contents: format!("{}_contents", base),
        };
        validate_table_name(&tables.metadata)?;
        validate_table_name(&tables.contents)?;
        Ok(tables)
    }

    /// Default parsed-output table for this collection.
    pub fn default_parsed(&self) -> String {
        default_destination(&self.base)
    }
}

pub fn default_destination(base: &str) -> String {
    format!("{}_parsed", base)
}

/// Contents table of a collection; the default parse-mode origin.
pub fn contents_table(base: &str) -> String {
    format!("{}_contents", base)
}

pub fn validate_table_name(name: &str) -> PipelineResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_TABLE_NAME_LEN {
        Ok(())
    } else {
        Err(PipelineError::InvalidTableName(name.to_string()))
    }
}

pub async fn table_exists(pool: &SqlitePool, name: &str) -> PipelineResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Fails with [`PipelineError::NotFound`] unless `name` is an existing table.
pub async fn require_table(pool: &SqlitePool, name: &str) -> PipelineResult<()> {
    validate_table_name(name)?;
    if table_exists(pool, name).await? {
        Ok(())
    } else {
        Err(PipelineError::NotFound(name.to_string()))
    }
}

/// Create the metadata and contents tables of a collection if missing.
pub async fn ensure_collection_tables(
    pool: &SqlitePool,
    base: &str,
) -> PipelineResult<CollectionTables> {
    let tables = CollectionTables::new(base)?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {metadata} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            checksum TEXT NOT NULL UNIQUE,
            success INTEGER NOT NULL,
            error_message TEXT,
            processed_at INTEGER NOT NULL
        )
        "#,
        metadata = tables.metadata
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {contents} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL UNIQUE,
            text_content TEXT NOT NULL,
            extracted_at INTEGER NOT NULL,
            FOREIGN KEY (file_id) REFERENCES {metadata}(id)
        )
        "#,
        contents = tables.contents,
        metadata = tables.metadata
    ))
    .execute(pool)
    .await?;

    Ok(tables)
}

/// Create a parsed-output table if missing.
pub async fn ensure_parsed_table(pool: &SqlitePool, name: &str) -> PipelineResult<()> {
    validate_table_name(name)?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            schema_name TEXT NOT NULL,
            parsed_data TEXT,
            failure_reason TEXT,
            run_id TEXT NOT NULL,
            parsed_at INTEGER NOT NULL
        )
        "#,
        name = name
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{name}_file_id ON {name}(file_id)",
        name = name
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the registry of schemas used by parse runs, and where they were used.
pub async fn ensure_schema_registry(pool: &SqlitePool) -> PipelineResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_registry (
            name TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            definition TEXT NOT NULL,
            registered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Every destination a schema name has been parsed into.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_usage (
            name TEXT NOT NULL,
            destination TEXT NOT NULL,
            PRIMARY KEY (name, destination)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
