//! Core data types that flow through the pipeline.
//!
//! Documents, their extracted text, and the per-run summaries reported at
//! the end of each mode.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Surrogate id of a row in `{table}_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DocumentId(pub i64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file found by the scanner, before it is read.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: String,
}

/// One `(file_id, text_content)` row of a contents table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRow {
    pub document_id: DocumentId,
    pub text: String,
}

/// Result of handing one document to the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New metadata and contents rows were committed.
    Ingested(DocumentId),
    /// A document with the same fingerprint already exists; nothing was written.
    Duplicate(DocumentId),
    /// Metadata row committed, no contents row; `reason` says why.
    ExtractionFailed { id: DocumentId, reason: String },
}

impl IngestOutcome {
    pub fn document_id(&self) -> DocumentId {
        match self {
            IngestOutcome::Ingested(id) | IngestOutcome::Duplicate(id) => *id,
            IngestOutcome::ExtractionFailed { id, .. } => *id,
        }
    }
}

/// Terminal counts of an extract-mode run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractSummary {
    pub found: u64,
    pub ingested: u64,
    pub duplicate: u64,
    pub failed: u64,
}

/// Terminal counts of a parse-mode run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    pub run_id: String,
    pub selected: u64,
    pub structured: u64,
    pub failed: u64,
}

impl ParseSummary {
    pub fn success_rate(&self) -> f64 {
        if self.selected == 0 {
            0.0
        } else {
            self.structured as f64 * 100.0 / self.selected as f64
        }
    }
}
