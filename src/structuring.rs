//! Schema-guided structuring of document text.
//!
//! [`StructuringEngine::structure`] never returns an error: every problem
//! with one document (blank text, a failed or malformed completion, output
//! that does not fit the schema) becomes [`ParseOutcome::Failed`], so the
//! caller can record it and move on to the next document.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::{backoff_delay, CompletionClient, CompletionError};
use crate::config::Config;
use crate::gate::CallGate;
use crate::schema::{SchemaHandle, ShapeMismatch};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("document has no text")]
    EmptyText,

    #[error(transparent)]
    Completion(CompletionError),

    #[error("output does not match schema: {0}")]
    ShapeMismatch(ShapeMismatch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A value that conforms to the schema.
    Structured(Value),
    Failed(FailureReason),
}

impl ParseOutcome {
    pub fn is_structured(&self) -> bool {
        matches!(self, ParseOutcome::Structured(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ParseOutcome::Structured(value) => Some(value),
            ParseOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            ParseOutcome::Structured(_) => None,
            ParseOutcome::Failed(reason) => Some(reason),
        }
    }
}

pub struct StructuringEngine {
    client: Arc<dyn CompletionClient>,
    gate: CallGate,
    max_retries: u32,
    max_text_chars: usize,
    backoff_base: Duration,
}

impl StructuringEngine {
    /// An engine that makes one attempt per document and sends text as is,
    /// up to 100 000 characters.
    pub fn new(client: Arc<dyn CompletionClient>, gate: CallGate) -> Self {
        Self {
            client,
            gate,
            max_retries: 0,
            max_text_chars: 100_000,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn from_config(client: Arc<dyn CompletionClient>, config: &Config) -> Self {
        Self::new(client, CallGate::from_config(&config.rate_limit))
            .with_retries(config.completion.max_retries)
            .with_max_text_chars(config.completion.max_text_chars)
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_text_chars(mut self, max_text_chars: usize) -> Self {
        self.max_text_chars = max_text_chars.max(1);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// Structure one document's text against `schema`.
    pub async fn structure(&self, text: &str, schema: &SchemaHandle) -> ParseOutcome {
        let text = text.trim();
        if text.is_empty() {
            return ParseOutcome::Failed(FailureReason::EmptyText);
        }

        let text = truncate_chars(text, self.max_text_chars);

        let value = match self.complete_with_retry(text, schema).await {
            Ok(value) => value,
            Err(e) => return ParseOutcome::Failed(FailureReason::Completion(e)),
        };

        match schema.validate(&value) {
            Ok(()) => ParseOutcome::Structured(value),
            Err(mismatch) => {
                debug!(schema = %schema.name, %mismatch, "completion output rejected");
                ParseOutcome::Failed(FailureReason::ShapeMismatch(mismatch))
            }
        }
    }

    async fn complete_with_retry(
        &self,
        text: &str,
        schema: &SchemaHandle,
    ) -> Result<Value, CompletionError> {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| CompletionError::Cancelled)?;
                self.client.complete(text, schema).await
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(self.backoff_base, attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "completion failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// At most `max` characters of `text`, cut on a character boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => {
            debug!(limit = max, "document text truncated");
            &text[..end]
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted replies and remembers what it was sent.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<Value, CompletionError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<Value, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, text: &str, _schema: &SchemaHandle) -> Result<Value, CompletionError> {
            self.seen.lock().unwrap().push(text.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CompletionError::Malformed("no scripted reply".into())))
        }
    }

    fn name_schema() -> SchemaHandle {
        SchemaRegistry::new()
            .register(
                json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
                Some("member"),
                "member.json",
            )
            .unwrap()
    }

    fn engine(client: Arc<ScriptedClient>) -> StructuringEngine {
        StructuringEngine::new(client, CallGate::new(1, Duration::ZERO))
            .with_backoff_base(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn conforming_output_is_structured() {
        let client = ScriptedClient::new(vec![Ok(json!({"name": "Jane Doe"}))]);
        let outcome = engine(client.clone()).structure("Member: Jane Doe", &name_schema()).await;
        assert_eq!(outcome, ParseOutcome::Structured(json!({"name": "Jane Doe"})));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn shape_mismatch_is_failed_not_partial() {
        let client = ScriptedClient::new(vec![Ok(json!({"name": 42}))]);
        let outcome = engine(client).structure("Member: 42", &name_schema()).await;
        match outcome {
            ParseOutcome::Failed(FailureReason::ShapeMismatch(m)) => assert_eq!(m.path, "$.name"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn blank_text_fails_without_a_call() {
        let client = ScriptedClient::new(vec![]);
        let outcome = engine(client.clone()).structure("  \n ", &name_schema()).await;
        assert_eq!(outcome, ParseOutcome::Failed(FailureReason::EmptyText));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn completion_error_is_failed() {
        let client = ScriptedClient::new(vec![Err(CompletionError::RateLimited)]);
        let outcome = engine(client.clone()).structure("text", &name_schema()).await;
        assert_eq!(
            outcome,
            ParseOutcome::Failed(FailureReason::Completion(CompletionError::RateLimited))
        );
        assert!(outcome.payload().is_none());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_bound() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Timeout),
            Err(CompletionError::Api { status: 502, message: "bad gateway".into() }),
            Ok(json!({"name": "Jane"})),
        ]);
        let outcome = engine(client.clone())
            .with_retries(2)
            .structure("text", &name_schema())
            .await;
        assert!(outcome.is_structured());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_last_error() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Network("reset".into())),
            Err(CompletionError::Network("refused".into())),
            Ok(json!({"name": "too late"})),
        ]);
        let outcome = engine(client.clone())
            .with_retries(1)
            .structure("text", &name_schema())
            .await;
        assert_eq!(
            outcome.failure(),
            Some(&FailureReason::Completion(CompletionError::Network("refused".into())))
        );
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn malformed_output_is_not_retried() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Malformed("not json".into())),
            Ok(json!({"name": "Jane"})),
        ]);
        let outcome = engine(client.clone())
            .with_retries(3)
            .structure("text", &name_schema())
            .await;
        assert!(!outcome.is_structured());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn long_text_is_truncated_before_the_call() {
        let client = ScriptedClient::new(vec![Ok(json!({"name": "x"}))]);
        engine(client.clone())
            .with_max_text_chars(5)
            .structure("ééééééééé", &name_schema())
            .await;
        assert_eq!(client.seen.lock().unwrap()[0], "ééééé");
    }

    #[tokio::test]
    async fn closed_gate_fails_the_document() {
        let client = ScriptedClient::new(vec![Ok(json!({"name": "x"}))]);
        let engine = engine(client.clone());
        engine.gate.close();
        let outcome = engine.structure("text", &name_schema()).await;
        assert_eq!(
            outcome,
            ParseOutcome::Failed(FailureReason::Completion(CompletionError::Cancelled))
        );
        assert_eq!(client.calls(), 0);
    }
}
