use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::cost::{CostCalculator, PricingTable};
use crate::error::StreamError;
use crate::protocol::canonical::{AssistantMessage, Model};
use crate::stream::pipeline::{self, PipelineSetup};
use crate::stream::AssistantMessageEventStream;
use crate::transport::{HttpTransport, PreparedRequest, PreparedUpstream, RetryPolicy, Transport};

/// One streaming call: the target model and the provider wire body, already
/// built for `model.api`.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: Model,
    pub body: serde_json::Value,
}

impl StreamRequest {
    #[must_use]
    pub fn new(model: Model, body: serde_json::Value) -> Self {
        Self { model, body }
    }
}

/// Per-call overrides of the client configuration.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Used instead of the provider's configured key.
    pub api_key: Option<String>,
    /// Extra headers, applied after the provider's own.
    pub headers: BTreeMap<String, String>,
    pub cancel: Option<CancellationToken>,
    /// `Some(Duration::ZERO)` disables the idle timeout for this call.
    pub idle_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl StreamOptions {
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Entry point: resolves providers from configuration and streams
/// canonical events from any supported backend.
///
/// Cheap to clone; clones share the transport and the connection pool.
#[derive(Clone)]
pub struct Client {
    config: Arc<AppConfig>,
    transport: Arc<dyn Transport>,
    cost: Arc<dyn CostCalculator>,
}

impl Client {
    /// Build a client with the reqwest transport and the configured prices.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] when the HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, StreamError> {
        let transport = HttpTransport::new(&config.http)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    #[must_use]
    pub fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        let cost = Arc::new(PricingTable::from_config(&config.pricing));
        Self {
            config: Arc::new(config),
            transport,
            cost,
        }
    }

    #[must_use]
    pub fn with_cost_calculator(mut self, cost: Arc<dyn CostCalculator>) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start streaming. Every failure, including bad credentials, arrives
    /// as the terminal `error` event rather than as a `Result`.
    #[must_use]
    pub fn stream(&self, request: StreamRequest, options: StreamOptions) -> AssistantMessageEventStream {
        let StreamRequest { model, body } = request;
        let prepared = match self.prepare(&model, &body, &options) {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::warn!(provider = %model.provider, error = %err, "request rejected before sending");
                return pipeline::rejected(&model, Arc::clone(&self.cost), &err);
            }
        };
        let idle_timeout = match options.idle_timeout {
            Some(limit) => (!limit.is_zero()).then_some(limit),
            None => self.config.stream.idle_timeout_for(model.api),
        };
        pipeline::run(PipelineSetup {
            model,
            request: prepared,
            transport: Arc::clone(&self.transport),
            cost: Arc::clone(&self.cost),
            retry: options
                .retry
                .unwrap_or_else(|| RetryPolicy::from_config(&self.config.retry)),
            idle_timeout,
            cancel: options.cancel.unwrap_or_default(),
        })
    }

    /// Stream to completion and return the final message.
    pub async fn complete(&self, request: StreamRequest, options: StreamOptions) -> AssistantMessage {
        self.stream(request, options).result().await
    }

    fn prepare(
        &self,
        model: &Model,
        body: &serde_json::Value,
        options: &StreamOptions,
    ) -> Result<PreparedRequest, StreamError> {
        let provider = self.config.provider(&model.provider);
        if let Some(provider) = provider.filter(|provider| provider.api != model.api) {
            return Err(StreamError::Config(format!(
                "Provider '{}' speaks {} but model '{}' expects {}",
                provider.name, provider.api, model.id, model.api
            )));
        }
        let base_url = match provider {
            Some(provider) => provider.base_url.as_str(),
            None if !model.base_url.is_empty() => model.base_url.as_str(),
            None => {
                return Err(StreamError::Config(format!(
                    "Unknown provider '{}' and the model has no base URL",
                    model.provider
                )))
            }
        };
        let api_key = options
            .api_key
            .clone()
            .or_else(|| provider.and_then(|provider| provider.resolve_api_key()));
        let mut upstream = PreparedUpstream::new(
            model.api,
            base_url,
            api_key.as_deref(),
            provider.and_then(|provider| provider.api_version.as_deref()),
        )?;
        if let Some(provider) = provider {
            upstream.extend_headers(&provider.headers)?;
        }
        upstream.extend_headers(&options.headers)?;

        let body = serde_json::to_vec(body)
            .map_err(|e| StreamError::Config(format!("Failed to serialize request body: {e}")))?;
        Ok(PreparedRequest {
            url: upstream.request_url(model).into_owned(),
            headers: upstream.headers().clone(),
            body: body.into(),
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("providers", &self.config.providers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::protocol::canonical::{Api, ErrorKind, StopReason};
    use crate::transport::TransportResponse;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<PreparedRequest>>,
    }

    impl Transport for Recorder {
        fn send(
            &self,
            request: PreparedRequest,
        ) -> BoxFuture<'_, Result<TransportResponse, StreamError>> {
            self.requests.lock().push(request);
            Box::pin(async { Err(StreamError::Transport("offline".into())) })
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            providers: vec![ProviderConfig {
                name: "anthropic".into(),
                api: Api::AnthropicMessages,
                base_url: "https://api.anthropic.com/v1/".into(),
                api_key: Some("sk-ant".into()),
                api_key_env: None,
                api_version: None,
                headers: BTreeMap::from([("anthropic-beta".into(), "fine-grained".into())]),
            }],
            ..AppConfig::default()
        }
    }

    fn request(provider: &str) -> StreamRequest {
        StreamRequest::new(
            Model::new("claude-sonnet", Api::AnthropicMessages, provider),
            serde_json::json!({"stream": true}),
        )
    }

    #[tokio::test]
    async fn test_request_resolved_from_provider_config() {
        let recorder = Arc::new(Recorder::default());
        let client = Client::with_transport(config(), recorder.clone());
        let options = StreamOptions::default()
            .with_retry(RetryPolicy::none())
            .with_header("x-trace", "1");
        let message = client.complete(request("anthropic"), options).await;
        assert_eq!(message.stop_reason, StopReason::Error);

        let requests = recorder.requests.lock();
        let sent = &requests[0];
        assert_eq!(sent.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(sent.headers["x-api-key"], "sk-ant");
        assert_eq!(sent.headers["anthropic-beta"], "fine-grained");
        assert_eq!(sent.headers["x-trace"], "1");
        assert_eq!(&sent.body[..], br#"{"stream":true}"#);
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_io() {
        let recorder = Arc::new(Recorder::default());
        let mut config = config();
        config.providers[0].api_key = None;
        let client = Client::with_transport(config, recorder.clone());
        let message = client.complete(request("anthropic"), StreamOptions::default()).await;
        assert_eq!(
            message.error_details.map(|d| (d.kind, d.retryable)),
            Some((ErrorKind::Authentication, false))
        );
        assert!(recorder.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_provider_api_mismatch_fails_without_io() {
        let recorder = Arc::new(Recorder::default());
        let client = Client::with_transport(config(), recorder.clone());
        let request = StreamRequest::new(
            Model::new("gpt-4o", Api::OpenaiCompletions, "anthropic"),
            serde_json::json!({}),
        );
        let message = client.complete(request, StreamOptions::default()).await;
        assert_eq!(
            message.error_details.map(|d| d.kind),
            Some(ErrorKind::InvalidRequest)
        );
        assert!(message
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("anthropic-messages")));
        assert!(recorder.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider_without_base_url() {
        let client = Client::with_transport(config(), Arc::new(Recorder::default()));
        let message = client.complete(request("nowhere"), StreamOptions::default()).await;
        assert_eq!(
            message.error_details.map(|d| d.kind),
            Some(ErrorKind::InvalidRequest)
        );
    }
}
