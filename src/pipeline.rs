//! Run orchestration: extract, parse, and full-pipeline modes.
//!
//! A [`Pipeline`] owns the store connection and the extraction
//! collaborator; the structuring engine is passed per parse run so extract
//! mode never needs completion credentials. Run-level checks (table names,
//! origin table, schema immutability) all happen before the first document
//! is touched. After that, per-document failures are counted and logged,
//! and only a database error stops the run.
//!
//! The `run_*` functions are the CLI entry points: they build everything
//! from a [`Config`], run one mode, and print the summary to stdout.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::completion::create_client;
use crate::config::{Config, ExtractConfig};
use crate::content_store::{ContentStore, DocumentSource};
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::{DocumentExtractor, TextExtractor};
use crate::models::{ExtractSummary, IngestOutcome, ParseSummary};
use crate::progress::{NoProgress, ProgressEvent, ProgressMode, ProgressReporter, Stage};
use crate::records::insert_parsed_record;
use crate::scan::scan_directory;
use crate::schema::{persist_schema, SchemaHandle, SchemaRegistry};
use crate::structuring::StructuringEngine;
use crate::tables::{
    contents_table, default_destination, ensure_parsed_table, require_table, validate_table_name,
    CollectionTables,
};
use crate::text_repository::TextRepository;

/// Row selection for a parse run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Structure a random subset of at most this many rows instead of all.
    pub sample: Option<usize>,
    /// Make the sample reproducible.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct FullSummary {
    pub extract: ExtractSummary,
    pub parse: ParseSummary,
}

pub struct Pipeline {
    pool: SqlitePool,
    extract: ExtractConfig,
    extractor: Arc<dyn TextExtractor>,
    reporter: Box<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(pool: SqlitePool, extract: ExtractConfig, extractor: Arc<dyn TextExtractor>) -> Self {
        Self {
            pool,
            extract,
            extractor,
            reporter: Box::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Extract mode: ingest every matching file under `dir` into collection `base`.
    pub async fn extract(&self, dir: &Path, base: &str) -> PipelineResult<ExtractSummary> {
        CollectionTables::new(base)?;

        self.reporter.report(ProgressEvent::Scanning {
            table: base.to_string(),
        });
        let scan = scan_directory(dir, &self.extract).map_err(|e| PipelineError::Scan {
            path: dir.display().to_string(),
            message: format!("{:#}", e),
        })?;
        let files = scan.files;

        let store = ContentStore::open(
            self.pool.clone(),
            base,
            Arc::clone(&self.extractor),
            self.extract.max_extract_bytes,
        )
        .await?;

        let total = files.len() as u64;
        let unwalkable = scan.errors.len() as u64;
        let mut summary = ExtractSummary {
            found: total + unwalkable,
            failed: unwalkable,
            ..ExtractSummary::default()
        };
        info!(table = base, files = total, unwalkable, "extracting");

        for (i, file) in files.iter().enumerate() {
            match tokio::fs::read(&file.path).await {
                Ok(bytes) => {
                    let file_path = file.path.to_string_lossy();
                    let source = DocumentSource {
                        file_name: &file.file_name,
                        file_path: &file_path,
                        content_type: &file.content_type,
                    };
                    match store.ingest(&bytes, source).await? {
                        IngestOutcome::Ingested(_) => summary.ingested += 1,
                        IngestOutcome::Duplicate(_) => summary.duplicate += 1,
                        IngestOutcome::ExtractionFailed { .. } => summary.failed += 1,
                    }
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "cannot read file");
                    summary.failed += 1;
                }
            }

            self.reporter.report(ProgressEvent::Item {
                stage: Stage::Extracting,
                table: base.to_string(),
                n: i as u64 + 1,
                total,
            });
        }

        Ok(summary)
    }

    /// Parse mode: structure rows of `origin` into `destination`.
    ///
    /// Appends exactly one record per selected row, tagged with a fresh run id.
    pub async fn parse(
        &self,
        engine: &StructuringEngine,
        origin: &str,
        destination: &str,
        schema: &SchemaHandle,
        options: ParseOptions,
    ) -> PipelineResult<ParseSummary> {
        check_distinct(origin, destination)?;
        require_table(&self.pool, origin).await?;
        self.prepare_destination(destination, schema).await?;

        let repository = TextRepository::new(self.pool.clone());
        let rows = match options.sample {
            Some(n) => repository.fetch_sample(origin, n, options.seed).await?,
            None => repository.fetch_all(origin).await?,
        };

        let total = rows.len() as u64;
        let mut summary = ParseSummary {
            run_id: Uuid::new_v4().to_string(),
            selected: total,
            ..ParseSummary::default()
        };
        info!(
            origin,
            destination,
            schema = %schema.name,
            run_id = %summary.run_id,
            rows = total,
            "structuring"
        );

        for (i, row) in rows.iter().enumerate() {
            let outcome = engine.structure(&row.text, schema).await;

            match outcome.failure() {
                None => summary.structured += 1,
                Some(reason) => {
                    warn!(file_id = %row.document_id, %reason, "structuring failed");
                    summary.failed += 1;
                }
            }

            insert_parsed_record(
                &self.pool,
                destination,
                row.document_id,
                &schema.name,
                &outcome,
                &summary.run_id,
            )
            .await?;

            self.reporter.report(ProgressEvent::Item {
                stage: Stage::Structuring,
                table: destination.to_string(),
                n: i as u64 + 1,
                total,
            });
        }

        Ok(summary)
    }

    /// Full mode: extract `dir` into `base`, then parse `{base}_contents`
    /// into `destination` (default `{base}_parsed`).
    ///
    /// The destination and schema are checked before anything is extracted.
    pub async fn full(
        &self,
        engine: &StructuringEngine,
        dir: &Path,
        base: &str,
        destination: Option<&str>,
        schema: &SchemaHandle,
        options: ParseOptions,
    ) -> PipelineResult<FullSummary> {
        let destination = destination
            .map(str::to_string)
            .unwrap_or_else(|| default_destination(base));
        CollectionTables::new(base)?;
        let origin = contents_table(base);
        check_distinct(&origin, &destination)?;
        self.prepare_destination(&destination, schema).await?;

        let extract = self.extract(dir, base).await?;
        let parse = self
            .parse(engine, &origin, &destination, schema, options)
            .await?;

        Ok(FullSummary { extract, parse })
    }

    /// Create `destination` and register `schema` against it.
    async fn prepare_destination(
        &self,
        destination: &str,
        schema: &SchemaHandle,
    ) -> PipelineResult<()> {
        ensure_parsed_table(&self.pool, destination).await?;
        persist_schema(&self.pool, schema, destination).await
    }
}

fn check_distinct(origin: &str, destination: &str) -> PipelineResult<()> {
    validate_table_name(origin)?;
    validate_table_name(destination)?;
    if origin == destination {
        return Err(PipelineError::Configuration(format!(
            "origin and destination are both '{}'",
            origin
        )));
    }
    Ok(())
}

fn load_schema(path: &Path, name: Option<&str>) -> PipelineResult<SchemaHandle> {
    Ok(SchemaRegistry::new().load_file(path, name)?)
}

fn build_engine(config: &Config) -> PipelineResult<StructuringEngine> {
    let client = create_client(&config.completion)?;
    Ok(StructuringEngine::from_config(Arc::from(client), config))
}

async fn open_pipeline(config: &Config, progress: ProgressMode) -> Result<Pipeline> {
    let pool = db::connect(config).await?;
    Ok(
        Pipeline::new(pool, config.extract.clone(), Arc::new(DocumentExtractor))
            .with_reporter(progress.reporter()),
    )
}

fn print_extract_summary(table: &str, summary: &ExtractSummary) {
    println!("extract {}", table);
    println!("  files found: {}", summary.found);
    println!("  ingested: {}", summary.ingested);
    println!("  duplicate: {}", summary.duplicate);
    println!("  failed: {}", summary.failed);
}

fn print_parse_summary(origin: &str, destination: &str, schema: &str, summary: &ParseSummary) {
    println!("parse {} -> {}", origin, destination);
    println!("  schema: {}", schema);
    println!("  run: {}", summary.run_id);
    println!("  selected: {}", summary.selected);
    println!("  structured: {}", summary.structured);
    println!("  failed: {}", summary.failed);
    println!("  success rate: {:.1}%", summary.success_rate());
}

pub async fn run_extract(
    config: &Config,
    dir: &Path,
    table: &str,
    progress: ProgressMode,
) -> Result<()> {
    let pipeline = open_pipeline(config, progress).await?;
    let summary = pipeline.extract(dir, table).await?;

    print_extract_summary(table, &summary);
    println!("ok");

    pipeline.pool().close().await;
    Ok(())
}

pub async fn run_parse(
    config: &Config,
    schema_path: &Path,
    schema_name: Option<&str>,
    origin: &str,
    destination: &str,
    options: ParseOptions,
    progress: ProgressMode,
) -> Result<()> {
    let schema = load_schema(schema_path, schema_name)?;
    let engine = build_engine(config)?;

    let pipeline = open_pipeline(config, progress).await?;
    let summary = pipeline
        .parse(&engine, origin, destination, &schema, options)
        .await?;

    print_parse_summary(origin, destination, &schema.name, &summary);
    println!("ok");

    pipeline.pool().close().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    config: &Config,
    dir: &Path,
    table: &str,
    schema_path: &Path,
    schema_name: Option<&str>,
    destination: Option<&str>,
    options: ParseOptions,
    progress: ProgressMode,
) -> Result<()> {
    let schema = load_schema(schema_path, schema_name)?;
    let engine = build_engine(config)?;

    let pipeline = open_pipeline(config, progress).await?;
    let summary = pipeline
        .full(&engine, dir, table, destination, &schema, options)
        .await?;

    let destination = destination
        .map(str::to_string)
        .unwrap_or_else(|| default_destination(table));
    print_extract_summary(table, &summary.extract);
    print_parse_summary(&contents_table(table), &destination, &schema.name, &summary.parse);
    println!("ok");

    pipeline.pool().close().await;
    Ok(())
}
