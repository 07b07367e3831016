use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};

use crate::config::HttpConfig;
use crate::error::StreamError;

use super::{PreparedRequest, Transport, TransportResponse};

fn build_reqwest_client(config: &HttpConfig) -> Result<reqwest::Client, StreamError> {
    let pool_idle_timeout = if config.pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.pool_idle_timeout_secs))
    };

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
        .redirect(reqwest::redirect::Policy::none());
    if config.read_timeout_secs > 0 {
        builder = builder.read_timeout(Duration::from_secs(config.read_timeout_secs));
    }

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| StreamError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| StreamError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Default [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with connection pooling and timeouts from config.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] when the proxy URL is invalid or the
    /// client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self, StreamError> {
        Ok(Self {
            client: build_reqwest_client(config)?,
        })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: PreparedRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, StreamError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(request.url.as_str())
                .headers(request.headers)
                .body(request.body)
                .send()
                .await
                .map_err(|err| StreamError::Transport(describe_reqwest_error(&err)))?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            tracing::debug!(status, url = %request.url, "upstream responded");
            let body = response
                .bytes_stream()
                .map_err(|err| StreamError::Disconnect(describe_reqwest_error(&err)))
                .boxed();
            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        })
    }
}
