//! Generative model invocation: request/response envelopes, tolerant JSON
//! extraction, and per-section validation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use solrep_core::{PipelineError, SectionName};
use thiserror::Error;
use tracing::{debug, warn};

pub mod extract;
pub mod http;
pub mod schema;

pub use extract::{extract_json, tail_chars, ExtractError};
pub use http::{BackoffPolicy, HttpModelClient, HttpModelConfig};
pub use schema::{validate_section, ValidatedSection};

pub const CRATE_NAME: &str = "solrep-model";

/// Raw model output kept in schema errors.
const RAW_OUTPUT_LIMIT: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model_id: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Error)]
pub enum ModelClientError {
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model request timed out after {0}s")]
    Timeout(u64),
    #[error("model client is shut down")]
    Closed,
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// A generative model endpoint returning its raw response envelope.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<JsonValue, ModelClientError>;
}

/// Concatenated generated text from a single- or multi-part response envelope.
pub fn unwrap_envelope(envelope: &JsonValue) -> Option<String> {
    if let Some(text) = envelope.as_str() {
        return Some(text.to_string());
    }
    if let Some(content) = envelope.get("content") {
        if let Some(text) = join_parts(content) {
            return Some(text);
        }
    }
    for key in ["output_text", "completion", "generation", "text"] {
        if let Some(text) = envelope.get(key).and_then(JsonValue::as_str) {
            return Some(text.to_string());
        }
    }
    if let Some(choice) = envelope.get("choices").and_then(|c| c.get(0)) {
        if let Some(content) = choice.get("message").and_then(|m| m.get("content")) {
            return join_parts(content);
        }
        return choice.get("text").and_then(JsonValue::as_str).map(str::to_string);
    }
    envelope
        .get("output")
        .and_then(|output| output.get("message"))
        .and_then(unwrap_envelope)
}

fn join_parts(content: &JsonValue) -> Option<String> {
    match content {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|part| {
                    part.get("type")
                        .and_then(JsonValue::as_str)
                        .map_or(true, |kind| kind == "text")
                })
                .filter_map(|part| part.as_str().or_else(|| part.get("text")?.as_str()))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.concat())
            }
        }
        _ => None,
    }
}

pub fn envelope_stop_reason(envelope: &JsonValue) -> Option<&str> {
    envelope
        .get("stop_reason")
        .or_else(|| envelope.get("stopReason"))
        .or_else(|| envelope.get("choices")?.get(0)?.get("finish_reason"))
        .and_then(JsonValue::as_str)
}

/// In-process retry behaviour for recoverable output defects.
#[derive(Debug, Clone, Copy)]
pub struct InvokerPolicy {
    /// Total attempts per section, including the first.
    pub max_attempts: usize,
    /// Upper bound when a truncated response doubles the token budget.
    pub max_tokens_ceiling: u32,
}

impl Default for InvokerPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_tokens_ceiling: 32_000,
        }
    }
}

#[derive(Clone)]
pub struct ModelInvoker {
    client: Arc<dyn ModelClient>,
    policy: InvokerPolicy,
}

impl ModelInvoker {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            policy: InvokerPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: InvokerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Calls the model and returns the validated, normalized payload for `section`.
    ///
    /// Truncated output is retried with a doubled token budget and output with no
    /// JSON at all is retried as-is; schema failures are returned immediately.
    pub async fn invoke_section(
        &self,
        section: SectionName,
        mut request: ModelRequest,
    ) -> Result<ValidatedSection, PipelineError> {
        let mut attempt = 1usize;
        loop {
            let err = match self.invoke_once(section, &request).await {
                Ok(validated) => return Ok(validated),
                Err(err) => err,
            };
            if attempt >= self.policy.max_attempts {
                return Err(err);
            }
            let retry = match &err {
                PipelineError::ModelOutputTruncated { .. }
                    if request.max_tokens < self.policy.max_tokens_ceiling =>
                {
                    request.max_tokens = request
                        .max_tokens
                        .saturating_mul(2)
                        .min(self.policy.max_tokens_ceiling);
                    true
                }
                PipelineError::ModelOutputNotJson { .. } => true,
                _ => false,
            };
            if !retry {
                return Err(err);
            }
            warn!(%section, attempt, kind = err.kind(), max_tokens = request.max_tokens, "retrying model invocation");
            attempt += 1;
        }
    }

    async fn invoke_once(
        &self,
        section: SectionName,
        request: &ModelRequest,
    ) -> Result<ValidatedSection, PipelineError> {
        let envelope = self
            .client
            .complete(request)
            .await
            .map_err(|err| PipelineError::ModelInvocationFailed(err.to_string()))?;
        let raw = unwrap_envelope(&envelope).ok_or_else(|| {
            PipelineError::ModelInvocationFailed("response envelope carried no text".to_string())
        })?;
        debug!(
            %section,
            chars = raw.chars().count(),
            stop_reason = envelope_stop_reason(&envelope).unwrap_or("unknown"),
            "model responded"
        );

        let value = extract_json(&raw).map_err(|err| match err {
            ExtractError::NoJsonStart { length, tail } => {
                PipelineError::ModelOutputNotJson { length, tail }
            }
            ExtractError::Unterminated {
                length,
                tail,
                reason,
                ..
            } => PipelineError::ModelOutputTruncated {
                length,
                tail,
                reason,
            },
            unexpected @ ExtractError::UnexpectedValue { .. } => {
                PipelineError::ModelOutputSchemaInvalid {
                    section,
                    reason: unexpected.to_string(),
                    raw: clip(&raw, RAW_OUTPUT_LIMIT),
                }
            }
        })?;

        validate_section(section, value).map_err(|reason| PipelineError::ModelOutputSchemaInvalid {
            section,
            reason,
            raw: clip(&raw, RAW_OUTPUT_LIMIT),
        })
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

enum Scripted {
    Envelope(JsonValue),
    Failure(u16, String),
}

/// Model client that replays scripted responses, for tests and dry runs.
#[derive(Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<JsonValue>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every unscripted call with `text`.
    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(text_envelope(text)),
            ..Self::default()
        }
    }

    pub fn then_text(self, text: &str) -> Self {
        self.push(Scripted::Envelope(text_envelope(text)))
    }

    pub fn then_envelope(self, envelope: JsonValue) -> Self {
        self.push(Scripted::Envelope(envelope))
    }

    pub fn then_failure(self, status: u16, body: &str) -> Self {
        self.push(Scripted::Failure(status, body.to_string()))
    }

    fn push(self, entry: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

pub fn text_envelope(text: &str) -> JsonValue {
    json!({
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn"
    })
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<JsonValue, ModelClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        match next {
            Some(Scripted::Envelope(envelope)) => Ok(envelope),
            Some(Scripted::Failure(status, body)) => Err(ModelClientError::Status { status, body }),
            None => self.fallback.clone().ok_or(ModelClientError::Status {
                status: 500,
                body: "script exhausted".to_string(),
            }),
        }
    }
}
