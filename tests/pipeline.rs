//! End-to-end pipeline scenarios against a real SQLite file, with a fake
//! extractor and a canned completion client standing in for pdf-extract
//! and the language model.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use docparse::completion::{CompletionClient, CompletionError};
use docparse::config::ExtractConfig;
use docparse::error::PipelineError;
use docparse::extract::{ExtractError, TextExtractor};
use docparse::gate::CallGate;
use docparse::pipeline::{ParseOptions, Pipeline};
use docparse::records::records_for_run;
use docparse::schema::{SchemaError, SchemaHandle, SchemaRegistry};
use docparse::structuring::StructuringEngine;
use docparse::tables::table_exists;

/// Treats file bytes as text; anything starting with `CORRUPT` fails.
struct FakeExtractor;

impl TextExtractor for FakeExtractor {
    fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<String, ExtractError> {
        let text = String::from_utf8_lossy(bytes).trim().to_string();
        if text.starts_with("CORRUPT") {
            return Err(ExtractError::Pdf("unreadable xref table".to_string()));
        }
        Ok(text)
    }
}

/// Answers from the document text: `Member: X` yields `{"name": X}`,
/// `REJECT` yields a non-retryable API error, anything else no name.
#[derive(Default)]
struct CannedClient {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for CannedClient {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, text: &str, _schema: &SchemaHandle) -> Result<Value, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("REJECT") {
            return Err(CompletionError::Api {
                status: 400,
                message: "bad request".to_string(),
            });
        }
        match text.strip_prefix("Member: ") {
            Some(name) => Ok(json!({ "name": name.lines().next().unwrap_or_default() })),
            None => Ok(json!({ "summary": "no member" })),
        }
    }
}

async fn test_pool(tmp: &TempDir) -> SqlitePool {
    let url = format!("sqlite:{}?mode=rwc", tmp.path().join("docparse.sqlite").display());
    SqlitePoolOptions::new().connect(&url).await.unwrap()
}

fn pipeline(pool: &SqlitePool) -> Pipeline {
    Pipeline::new(pool.clone(), ExtractConfig::default(), Arc::new(FakeExtractor))
}

fn engine(client: Arc<CannedClient>) -> StructuringEngine {
    StructuringEngine::new(client, CallGate::new(1, Duration::ZERO))
        .with_backoff_base(Duration::from_millis(1))
}

fn member_schema() -> SchemaHandle {
    SchemaRegistry::new()
        .register(
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }),
            Some("member"),
            "member.json",
        )
        .unwrap()
}

fn write_docs(dir: &Path, docs: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    for (name, body) in docs {
        fs::write(dir.join(name), body).unwrap();
    }
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn full_run_isolates_a_corrupt_document() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(
        &dir,
        &[("a.pdf", "Member: Jane Doe"), ("b.pdf", "CORRUPT %PDF")],
    );

    let client = Arc::new(CannedClient::default());
    let summary = pipeline(&pool)
        .full(&engine(client.clone()), &dir, "claims", None, &member_schema(), ParseOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.extract.found, 2);
    assert_eq!(summary.extract.ingested, 1);
    assert_eq!(summary.extract.failed, 1);
    assert_eq!(count(&pool, "claims_metadata").await, 2);
    assert_eq!(count(&pool, "claims_contents").await, 1);

    let failed: Option<String> = sqlx::query_scalar(
        "SELECT error_message FROM claims_metadata WHERE file_name = 'b.pdf'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(failed.unwrap().contains("xref"));

    assert_eq!(summary.parse.selected, 1);
    assert_eq!(summary.parse.structured, 1);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);

    let records = records_for_run(&pool, "claims_parsed", &summary.parse.run_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].schema_name, "member");
    let payload: Value = serde_json::from_str(records[0].parsed_data.as_deref().unwrap()).unwrap();
    assert_eq!(payload, json!({"name": "Jane Doe"}));
}

#[tokio::test]
async fn re_extracting_the_same_directory_adds_nothing() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(
        &dir,
        &[("a.pdf", "Member: Jane Doe"), ("b.pdf", "Member: John Roe")],
    );

    let first = pipeline(&pool).extract(&dir, "claims").await.unwrap();
    assert_eq!(first.ingested, 2);

    // Same bytes under a new name are still the same document.
    fs::write(dir.join("copy-of-a.pdf"), "Member: Jane Doe").unwrap();

    let second = pipeline(&pool).extract(&dir, "claims").await.unwrap();
    assert_eq!(second.found, 3);
    assert_eq!(second.ingested, 0);
    assert_eq!(second.duplicate, 3);
    assert_eq!(count(&pool, "claims_metadata").await, 2);
    assert_eq!(count(&pool, "claims_contents").await, 2);
}

#[tokio::test]
async fn every_selected_row_gets_exactly_one_record() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(
        &dir,
        &[
            ("a.pdf", "Member: Jane Doe"),
            ("b.pdf", "REJECT this one"),
            ("c.pdf", "Invoice with no member line"),
            ("d.pdf", "Member: John Roe"),
        ],
    );

    let p = pipeline(&pool);
    p.extract(&dir, "claims").await.unwrap();
    let summary = p
        .parse(
            &engine(Arc::new(CannedClient::default())),
            "claims_contents",
            "claims_parsed",
            &member_schema(),
            ParseOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(summary.selected, 4);
    assert_eq!(summary.structured, 2);
    assert_eq!(summary.failed, 2);

    let records = records_for_run(&pool, "claims_parsed", &summary.run_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record.parsed_data.is_none(), record.failure_reason.is_some());
    }

    let reasons: Vec<&str> = records
        .iter()
        .filter_map(|r| r.failure_reason.as_deref())
        .collect();
    assert!(reasons.iter().any(|r| r.contains("400")));
    assert!(reasons.iter().any(|r| r.contains("name")));
}

#[tokio::test]
async fn sampling_is_bounded_and_reproducible() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    let names: Vec<String> = (0..6).map(|i| format!("doc{}.pdf", i)).collect();
    let bodies: Vec<String> = (0..6).map(|i| format!("Member: Person {}", i)).collect();
    let docs: Vec<(&str, &str)> = names
        .iter()
        .zip(&bodies)
        .map(|(n, b)| (n.as_str(), b.as_str()))
        .collect();
    write_docs(&dir, &docs);

    let p = pipeline(&pool);
    p.extract(&dir, "claims").await.unwrap();
    let engine = engine(Arc::new(CannedClient::default()));
    let schema = member_schema();

    let sampled = |sample, seed| ParseOptions {
        sample: Some(sample),
        seed,
    };

    let small = p
        .parse(&engine, "claims_contents", "claims_parsed", &schema, sampled(3, None))
        .await
        .unwrap();
    assert_eq!(small.selected, 3);

    let oversized = p
        .parse(&engine, "claims_contents", "claims_parsed", &schema, sampled(50, None))
        .await
        .unwrap();
    assert_eq!(oversized.selected, 6);

    let mut picks = Vec::new();
    for _ in 0..2 {
        let run = p
            .parse(&engine, "claims_contents", "claims_parsed", &schema, sampled(3, Some(42)))
            .await
            .unwrap();
        let ids: BTreeSet<i64> = records_for_run(&pool, "claims_parsed", &run.run_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.file_id)
            .collect();
        assert_eq!(ids.len(), 3);
        picks.push(ids);
    }
    assert_eq!(picks[0], picks[1]);
}

#[tokio::test]
async fn missing_origin_fails_before_any_work() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let client = Arc::new(CannedClient::default());

    let err = pipeline(&pool)
        .parse(
            &engine(client.clone()),
            "ghost_contents",
            "ghost_parsed",
            &member_schema(),
            ParseOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NotFound(ref t) if t == "ghost_contents"));
    assert!(!table_exists(&pool, "ghost_parsed").await.unwrap());
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn origin_and_destination_must_differ() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let err = pipeline(&pool)
        .parse(
            &engine(Arc::new(CannedClient::default())),
            "claims_contents",
            "claims_contents",
            &member_schema(),
            ParseOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn unknown_schema_type_is_rejected() {
    let err = SchemaRegistry::new()
        .register(
            json!({"type": "object", "properties": {"name": {"type": "text"}}}),
            None,
            "/schemas/member.json",
        )
        .unwrap_err();
    assert!(matches!(err, SchemaError::UnknownType { ref tag, .. } if tag == "text"));

    let err: PipelineError = err.into();
    assert!(matches!(err, PipelineError::InvalidSchema(_)));
}

#[tokio::test]
async fn referenced_schema_cannot_change_definition() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(&dir, &[("a.pdf", "Member: Jane Doe")]);

    let p = pipeline(&pool);
    let engine = engine(Arc::new(CannedClient::default()));
    p.full(&engine, &dir, "claims", None, &member_schema(), ParseOptions::default())
        .await
        .unwrap();

    let changed = SchemaRegistry::new()
        .register(
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "member_id": { "type": "string" }
                },
                "required": ["name", "member_id"]
            }),
            Some("member"),
            "member.json",
        )
        .unwrap();

    let err = p
        .parse(&engine, "claims_contents", "claims_parsed", &changed, ParseOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidSchema(SchemaError::InUse { .. })
    ));
    assert_eq!(count(&pool, "claims_parsed").await, 1);

    // The unchanged definition is still accepted.
    let again = p
        .parse(&engine, "claims_contents", "claims_parsed", &member_schema(), ParseOptions::default())
        .await
        .unwrap();
    assert_eq!(again.structured, 1);
    assert_eq!(count(&pool, "claims_parsed").await, 2);
}

fn changed_member_schema() -> SchemaHandle {
    SchemaRegistry::new()
        .register(
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "member_id": { "type": "string" }
                },
                "required": ["name", "member_id"]
            }),
            Some("member"),
            "member.json",
        )
        .unwrap()
}

#[tokio::test]
async fn referenced_schema_is_locked_across_destinations() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(&dir, &[("a.pdf", "Member: Jane Doe")]);

    let p = pipeline(&pool);
    let engine = engine(Arc::new(CannedClient::default()));
    p.extract(&dir, "claims").await.unwrap();
    p.parse(&engine, "claims_contents", "a_parsed", &member_schema(), ParseOptions::default())
        .await
        .unwrap();

    let err = p
        .parse(&engine, "claims_contents", "b_parsed", &changed_member_schema(), ParseOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidSchema(SchemaError::InUse { ref table, .. }) if table == "a_parsed"
    ));
    assert_eq!(count(&pool, "b_parsed").await, 0);

    // The definition already in use keeps working in both tables.
    let again = p
        .parse(&engine, "claims_contents", "a_parsed", &member_schema(), ParseOptions::default())
        .await
        .unwrap();
    assert_eq!(again.structured, 1);
    let other = p
        .parse(&engine, "claims_contents", "b_parsed", &member_schema(), ParseOptions::default())
        .await
        .unwrap();
    assert_eq!(other.structured, 1);
}

#[tokio::test]
async fn full_run_checks_schema_before_extracting() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(&dir, &[("a.pdf", "Member: Jane Doe")]);

    let p = pipeline(&pool);
    let client = Arc::new(CannedClient::default());
    let engine = engine(client.clone());
    p.full(&engine, &dir, "claims", None, &member_schema(), ParseOptions::default())
        .await
        .unwrap();

    fs::write(dir.join("b.pdf"), "Member: John Roe").unwrap();
    let err = p
        .full(&engine, &dir, "claims", None, &changed_member_schema(), ParseOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidSchema(SchemaError::InUse { .. })
    ));
    assert_eq!(count(&pool, "claims_metadata").await, 1);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn full_run_rejects_contents_as_destination_before_extracting() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(&dir, &[("a.pdf", "Member: Jane Doe")]);

    let err = pipeline(&pool)
        .full(
            &engine(Arc::new(CannedClient::default())),
            &dir,
            "claims",
            Some("claims_contents"),
            &member_schema(),
            ParseOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(!table_exists(&pool, "claims_metadata").await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn unwalkable_entry_counts_as_failed_and_run_continues() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let dir = tmp.path().join("claims");
    write_docs(&dir, &[("a.pdf", "Member: Jane Doe")]);
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("nested").join("b.pdf"), "Member: John Roe").unwrap();
    std::os::unix::fs::symlink(&dir, dir.join("nested").join("loop")).unwrap();

    let config = ExtractConfig {
        follow_symlinks: true,
        ..ExtractConfig::default()
    };
    let summary = Pipeline::new(pool.clone(), config, Arc::new(FakeExtractor))
        .extract(&dir, "claims")
        .await
        .unwrap();

    assert_eq!(summary.ingested, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.found, 3);
    assert_eq!(count(&pool, "claims_metadata").await, 2);
}
