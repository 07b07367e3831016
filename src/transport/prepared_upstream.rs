use std::borrow::Cow;

use base64::Engine as _;

use crate::error::StreamError;
use crate::protocol::canonical::{Api, Model};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const CODEX_AUTH_CLAIM: &str = "https://api.openai.com/auth";
const CODEX_ORIGINATOR: &str = "unistream";

/// Endpoint and auth headers for one request against a provider.
#[derive(Debug, Clone)]
pub struct PreparedUpstream {
    api: Api,
    base_url: String,
    static_headers: http::HeaderMap,
}

fn header_value(value: &str, what: &str) -> Result<http::HeaderValue, StreamError> {
    http::HeaderValue::from_str(value)
        .map_err(|_| StreamError::Auth(format!("{what} contains characters not allowed in a header")))
}

/// Extract the ChatGPT account id from a Codex access token (a JWT).
///
/// # Errors
///
/// Returns [`StreamError::Auth`] when the token is not a JWT or lacks the
/// account claim.
pub fn codex_account_id(token: &str) -> Result<String, StreamError> {
    let malformed = || StreamError::Auth("Failed to extract account id from Codex token".into());
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| malformed())?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).map_err(|_| malformed())?;
    claims
        .get(CODEX_AUTH_CLAIM)
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .ok_or_else(malformed)
}

impl PreparedUpstream {
    /// Resolve headers for `api`. No network I/O happens here; a missing or
    /// malformed credential fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Auth`] when the key is missing or unusable.
    pub fn new(
        api: Api,
        base_url: &str,
        api_key: Option<&str>,
        api_version: Option<&str>,
    ) -> Result<Self, StreamError> {
        let key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| StreamError::Auth(format!("No API key configured for {api}")))?;

        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/event-stream"),
        );

        match api {
            Api::OpenaiCompletions | Api::OpenaiResponses | Api::GoogleGeminiCli => {
                headers.insert(
                    http::header::AUTHORIZATION,
                    header_value(&format!("Bearer {key}"), "API key")?,
                );
            }
            Api::OpenaiCodexResponses => {
                let account_id = codex_account_id(key)?;
                headers.insert(
                    http::header::AUTHORIZATION,
                    header_value(&format!("Bearer {key}"), "Codex token")?,
                );
                headers.insert("chatgpt-account-id", header_value(&account_id, "account id")?);
                headers.insert(
                    "OpenAI-Beta",
                    http::HeaderValue::from_static("responses=experimental"),
                );
                headers.insert("originator", http::HeaderValue::from_static(CODEX_ORIGINATOR));
            }
            Api::AnthropicMessages => {
                headers.insert("x-api-key", header_value(key, "API key")?);
                let version = api_version.unwrap_or(DEFAULT_ANTHROPIC_VERSION);
                headers.insert("anthropic-version", header_value(version, "api_version")?);
            }
            Api::GoogleGenerativeAi => {
                headers.insert("x-goog-api-key", header_value(key, "API key")?);
            }
        }

        Ok(Self {
            api,
            base_url: base_url.trim().trim_end_matches('/').to_owned(),
            static_headers: headers,
        })
    }

    /// Add or override headers.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] for a name or value HTTP rejects.
    pub fn extend_headers<'a, I>(&mut self, headers: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in headers {
            let name = http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| StreamError::Config(format!("Invalid header name '{name}'")))?;
            let value = http::HeaderValue::from_str(value)
                .map_err(|_| StreamError::Config(format!("Invalid value for header '{name}'")))?;
            self.static_headers.insert(name, value);
        }
        Ok(())
    }

    /// Streaming endpoint for `model`.
    #[must_use]
    pub fn request_url<'a>(&'a self, model: &Model) -> Cow<'a, str> {
        let base = if model.base_url.is_empty() {
            self.base_url.as_str()
        } else {
            model.base_url.trim_end_matches('/')
        };
        let url = match self.api {
            Api::AnthropicMessages => format!("{base}/messages"),
            Api::OpenaiCompletions => format!("{base}/chat/completions"),
            Api::OpenaiResponses => format!("{base}/responses"),
            Api::OpenaiCodexResponses => format!("{base}/codex/responses"),
            Api::GoogleGenerativeAi => {
                format!("{base}/models/{}:streamGenerateContent?alt=sse", model.id)
            }
            Api::GoogleGeminiCli => format!("{base}/v1internal:streamGenerateContent?alt=sse"),
        };
        Cow::Owned(url)
    }

    #[must_use]
    pub fn headers(&self) -> &http::HeaderMap {
        &self.static_headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codex_token(account: &str) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"none"}"#);
        let payload = engine.encode(
            serde_json::json!({ CODEX_AUTH_CLAIM: { "chatgpt_account_id": account } })
                .to_string(),
        );
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_anthropic_headers_and_url() {
        let prepared = PreparedUpstream::new(
            Api::AnthropicMessages,
            "https://api.anthropic.com/v1/",
            Some("sk-ant"),
            None,
        )
        .unwrap();
        assert_eq!(prepared.headers()["x-api-key"], "sk-ant");
        assert_eq!(prepared.headers()["anthropic-version"], "2023-06-01");
        let model = Model::new("claude", Api::AnthropicMessages, "anthropic");
        assert_eq!(
            prepared.request_url(&model),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_openai_bearer() {
        let prepared = PreparedUpstream::new(
            Api::OpenaiCompletions,
            "https://api.openai.com/v1",
            Some("sk-test"),
            None,
        )
        .unwrap();
        assert_eq!(prepared.headers()[http::header::AUTHORIZATION], "Bearer sk-test");
    }

    #[test]
    fn test_gemini_url_contains_model_and_sse() {
        let prepared = PreparedUpstream::new(
            Api::GoogleGenerativeAi,
            "https://generativelanguage.googleapis.com/v1beta",
            Some("g-key"),
            None,
        )
        .unwrap();
        let model = Model::new("gemini-2.5-pro", Api::GoogleGenerativeAi, "google");
        assert_eq!(
            prepared.request_url(&model),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(prepared.headers()["x-goog-api-key"], "g-key");
    }

    #[test]
    fn test_codex_headers_from_jwt() {
        let token = codex_token("acct_123");
        let prepared = PreparedUpstream::new(
            Api::OpenaiCodexResponses,
            "https://chatgpt.com/backend-api",
            Some(&token),
            None,
        )
        .unwrap();
        assert_eq!(prepared.headers()["chatgpt-account-id"], "acct_123");
        assert_eq!(prepared.headers()["openai-beta"], "responses=experimental");
        let model = Model::new("gpt-5-codex", Api::OpenaiCodexResponses, "codex");
        assert_eq!(
            prepared.request_url(&model),
            "https://chatgpt.com/backend-api/codex/responses"
        );
    }

    #[test]
    fn test_codex_rejects_non_jwt() {
        let err = PreparedUpstream::new(
            Api::OpenaiCodexResponses,
            "https://chatgpt.com/backend-api",
            Some("sk-plain-key"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Auth(_)));
    }

    #[test]
    fn test_missing_key_is_auth_error() {
        for key in [None, Some(""), Some("   ")] {
            let err = PreparedUpstream::new(Api::OpenaiResponses, "https://x", key, None)
                .unwrap_err();
            assert!(matches!(err, StreamError::Auth(_)));
        }
    }

    #[test]
    fn test_model_base_url_overrides_provider() {
        let prepared =
            PreparedUpstream::new(Api::OpenaiCompletions, "https://a.example", Some("k"), None)
                .unwrap();
        let model = Model::new("m", Api::OpenaiCompletions, "p").with_base_url("https://b.example/v1/");
        assert_eq!(
            prepared.request_url(&model),
            "https://b.example/v1/chat/completions"
        );
    }
}
