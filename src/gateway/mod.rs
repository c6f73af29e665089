//! Chat gateway: routes completions to the hosted or local backend, retries
//! transient failures, and records usage.

pub mod error;
pub mod openai_compat;
pub mod pricing;
pub mod types;
pub mod usage;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use openai_compat::{ChatProvider, OpenAiCompatAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use pricing::{ModelRates, PricingTable, DEFAULT_PRICING_KEY};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// Prefix that always routes a model to the local backend.
pub const LOCAL_MODEL_PREFIX: &str = "local/";

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Call the gateway and absorb any failure into an error-annotated completion
/// with zero usage. The engine never sees a chat error through this path.
pub async fn complete(gateway: &dyn ChatGateway, req: ChatRequest) -> Completion {
    let model = req.model.clone();
    let caller = req.attribution.caller;
    match gateway.chat(req).await {
        Ok(resp) => Completion {
            content: resp.content,
            usage: resp.usage,
            failed: false,
        },
        Err(err) => {
            warn!(%model, caller, error = %err, "chat completion failed");
            Completion {
                content: format!("[Error generating response: {err}]"),
                usage: TokenUsage::default(),
                failed: true,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    primary: Arc<dyn ChatProvider>,
    local: Option<Arc<dyn ChatProvider>>,
    local_models: HashSet<String>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Hosted backend from env plus the local backend when `VLLM_BASE_URL` is set.
    pub fn from_env(
        usage_sink: Arc<U>,
        local_models: impl IntoIterator<Item = String>,
    ) -> Result<Self, ProviderError> {
        let primary = Arc::new(OpenAiCompatAdapter::openai_from_env()?);
        let local = OpenAiCompatAdapter::local_from_env()?
            .map(|adapter| Arc::new(adapter) as Arc<dyn ChatProvider>);
        Ok(Self::with_config(
            primary,
            local,
            local_models,
            usage_sink,
            GatewayConfig::default(),
        ))
    }

    pub fn with_config(
        primary: Arc<dyn ChatProvider>,
        local: Option<Arc<dyn ChatProvider>>,
        local_models: impl IntoIterator<Item = String>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            primary,
            local,
            local_models: local_models.into_iter().collect(),
            usage_sink,
            config,
        }
    }

    /// Whether `model` belongs on the local backend.
    pub fn is_local_model(&self, model: &str) -> bool {
        self.local_models.contains(model) || model.starts_with(LOCAL_MODEL_PREFIX)
    }

    fn route(&self, model: &str) -> &Arc<dyn ChatProvider> {
        if !self.is_local_model(model) {
            return &self.primary;
        }
        match &self.local {
            Some(local) => {
                info!(%model, "routing to local backend");
                local
            }
            None => {
                warn!(
                    %model,
                    "local model requested but no local backend configured; falling back to primary"
                );
                &self.primary
            }
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let provider = self.route(&req.model);
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(provider.name(), &req, Some(&resp), None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(provider.name(), &req, None, Some(err.code()))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    warn!(model = %req.model, attempt, error = %err, ?delay, "retrying chat call");
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::backend("gateway", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        backend: &'static str,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        error_code: Option<&str>,
    ) {
        let mut record = ProviderCallRecord::new(backend, req.model.clone(), req.attribution.caller)
            .run(req.attribution.run_id)
            .persona(req.attribution.persona_id);
        if let Some(resp) = resp {
            record = record
                .usage(&resp.usage)
                .latency(resp.latency.as_millis() as u64);
        }
        if let Some(code) = error_code {
            record = record.error(code);
        }
        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
