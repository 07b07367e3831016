mod http_transport;
mod prepared_upstream;
mod retry_policy;

pub use http_transport::HttpTransport;
pub use prepared_upstream::{codex_account_id, PreparedUpstream};
pub use retry_policy::{retry_after_from_headers, RetryDecision, RetryPolicy};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::StreamError;

/// Response body as a stream of chunks. Read errors mid-body surface as
/// [`StreamError::Disconnect`].
pub type ByteStream = BoxStream<'static, Result<bytes::Bytes, StreamError>>;

/// A fully formed request: the provider wire body plus resolved URL and
/// headers.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: bytes::Bytes,
}

/// Status line, headers and the still-unread body.
pub struct TransportResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and returns the response head with a streaming body.
///
/// Implementations do not retry and do not interpret non-2xx statuses; the
/// pipeline owns both. Dropping the returned future or body stream must
/// release the connection.
pub trait Transport: Send + Sync {
    fn send(&self, request: PreparedRequest)
        -> BoxFuture<'_, Result<TransportResponse, StreamError>>;
}
