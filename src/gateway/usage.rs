//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs every call through a UsageSink. This decouples the gateway
//! from any specific storage backend:
//! - The worker binary uses StderrUsageSink (one JSON line per call)
//! - Tests use NoopUsageSink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::TokenUsage;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// Record of a chat call for logging.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    /// Backend that served the call: "openai", "local".
    pub backend: &'static str,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub run_id: Option<i64>,
    pub persona_id: Option<i64>,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(backend: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            backend,
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            run_id: None,
            persona_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn usage(mut self, usage: &TokenUsage) -> Self {
        self.prompt_tokens = usage.prompt_tokens;
        self.completion_tokens = usage.completion_tokens;
        self
    }

    pub fn run(mut self, run_id: Option<i64>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn persona(mut self, persona_id: Option<i64>) -> Self {
        self.persona_id = persona_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are logged, not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that writes each record to stderr as a JSON line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize usage record"),
        }
    }
}
