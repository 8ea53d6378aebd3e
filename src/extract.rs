//! Text extraction collaborator.
//!
//! Turns raw document bytes into plain UTF-8 text. The pipeline only sees
//! the [`TextExtractor`] trait; [`DocumentExtractor`] is the default
//! implementation (PDF via `pdf-extract`, plain text and Markdown by
//! decoding). Extraction never panics through to the caller: a failure is
//! an [`ExtractError`] and the document is recorded as not extracted.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_UNKNOWN: &str = "application/octet-stream";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("document yielded no text")]
    Empty,

    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("extractor crashed: {0}")]
    Crashed(String),
}

/// Converts document bytes to text.
///
/// Implementations are called once per new document, from a blocking
/// worker thread, and must be safe to share across threads.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], content_type: &str) -> Result<String, ExtractError>;
}

/// Default extractor: PDF, plain text, Markdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentExtractor;

impl TextExtractor for DocumentExtractor {
    fn extract(&self, bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
        let text = match content_type {
            MIME_PDF => extract_pdf(bytes)?,
            MIME_TEXT | MIME_MARKDOWN => String::from_utf8(bytes.to_vec())
                .map_err(|e| ExtractError::Encoding(e.to_string()))?,
            other => return Err(ExtractError::UnsupportedContentType(other.to_string())),
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractError::Empty);
        }
        Ok(text.to_string())
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    match panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes))) {
        Ok(result) => result.map_err(|e| ExtractError::Pdf(e.to_string())),
        Err(payload) => Err(ExtractError::Crashed(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Content type from the file extension.
pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "txt" | "text" => MIME_TEXT,
        "md" | "markdown" => MIME_MARKDOWN,
        _ => MIME_UNKNOWN,
    }
}
