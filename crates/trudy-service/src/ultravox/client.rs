//! Ultravox API client implementation.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::types::{
    CreateAgentRequest, CreateCallRequest, CreateCorpusRequest, CreateVoiceRequest, Created,
    ScheduledBatchRequest, ScheduledBatchResponse, ToolDefinition,
};
use crate::retry::{retry_with_backoff, RetryPolicy, Transient};

/// Error type for Ultravox operations.
#[derive(Debug, thiserror::Error)]
pub enum UltravoxError {
    /// The request never got an answer (connect error, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Ultravox answered with a non-success status.
    #[error("Ultravox API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the body, or the status line.
        message: String,
        /// `Retry-After` seconds on 429 answers.
        retry_after: Option<u64>,
    },

    /// The answer could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A create call succeeded but the answer carried no ID.
    #[error("Ultravox response missing {0}")]
    MissingId(&'static str),
}

impl UltravoxError {
    /// Whether Ultravox kept rate limiting us.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }
}

impl Transient for UltravoxError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Serialization(_) | Self::MissingId(_) => false,
        }
    }
}

/// Ultravox API client.
#[derive(Debug, Clone)]
pub struct UltravoxClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl UltravoxClient {
    /// Create a new Ultravox client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, UltravoxError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry,
        })
    }

    /// Place a call. Returns the provider call ID.
    pub async fn create_call(&self, request: &CreateCallRequest) -> Result<String, UltravoxError> {
        self.create("/calls", request, "call id").await
    }

    /// Create an agent. Returns the provider agent ID.
    pub async fn create_agent(&self, request: &CreateAgentRequest) -> Result<String, UltravoxError> {
        self.create("/agents", request, "agent id").await
    }

    /// Push changed agent fields.
    pub async fn update_agent(&self, agent_id: &str, changes: &Value) -> Result<(), UltravoxError> {
        self.request(Method::PATCH, &format!("/agents/{agent_id}"), Some(changes))
            .await
            .map(|_| ())
    }

    /// Create a corpus. Returns the provider corpus ID.
    pub async fn create_corpus(
        &self,
        request: &CreateCorpusRequest,
    ) -> Result<String, UltravoxError> {
        self.create("/corpora", request, "corpus id").await
    }

    /// Create a tool. Returns the provider tool ID.
    pub async fn create_tool(&self, tool: &ToolDefinition) -> Result<String, UltravoxError> {
        self.create("/tools", tool, "tool id").await
    }

    /// Replace a tool's definition.
    pub async fn update_tool(
        &self,
        tool_id: &str,
        tool: &ToolDefinition,
    ) -> Result<(), UltravoxError> {
        self.request(Method::PATCH, &format!("/tools/{tool_id}"), Some(tool))
            .await
            .map(|_| ())
    }

    /// Delete a tool.
    pub async fn delete_tool(&self, tool_id: &str) -> Result<(), UltravoxError> {
        self.request::<()>(Method::DELETE, &format!("/tools/{tool_id}"), None)
            .await
            .map(|_| ())
    }

    /// Create or import a voice. Returns the provider voice ID.
    pub async fn create_voice(&self, request: &CreateVoiceRequest) -> Result<String, UltravoxError> {
        self.create("/voices", request, "voice id").await
    }

    /// Schedule outbound batches for an agent.
    pub async fn create_scheduled_batch(
        &self,
        agent_id: &str,
        request: &ScheduledBatchRequest,
    ) -> Result<ScheduledBatchResponse, UltravoxError> {
        let data = self
            .request(
                Method::POST,
                &format!("/agents/{agent_id}/scheduled-batches"),
                Some(request),
            )
            .await?;
        if data.is_null() {
            return Ok(ScheduledBatchResponse::default());
        }
        Ok(serde_json::from_value(data)?)
    }

    async fn create<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        what: &'static str,
    ) -> Result<String, UltravoxError> {
        let data = self.request(Method::POST, path, Some(body)).await?;
        let created: Created = serde_json::from_value(data)?;
        created.id.ok_or(UltravoxError::MissingId(what))
    }

    /// Send a request with retries and return the unwrapped `data` payload.
    async fn request<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value, UltravoxError> {
        let url = format!("{}{}", self.base_url, path);

        retry_with_backoff(&self.retry, || {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {}", self.api_key));
            if let Some(body) = body {
                builder = builder.json(body);
            }
            async move {
                let response = builder.send().await?;
                Self::handle_response(response).await
            }
        })
        .await
        .map_err(|e| {
            tracing::warn!(method = %method, path = %path, error = %e, "Ultravox request failed");
            e
        })
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, UltravoxError> {
        let status = response.status();

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(unwrap_data(serde_json::from_str(&text)?));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let message = response
            .json::<Value>()
            .await
            .ok()
            .as_ref()
            .and_then(error_message)
            .unwrap_or_else(|| format!("HTTP {status}"));

        Err(UltravoxError::Api {
            status: status.as_u16(),
            message,
            retry_after,
        })
    }
}

/// Ultravox wraps some payloads in `{"data": ...}`.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn error_message(body: &Value) -> Option<String> {
    ["detail", "message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> UltravoxClient {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::with_max_attempts(3)
        };
        UltravoxClient::new(server.uri(), "uv_key", Duration::from_secs(5), retry).unwrap()
    }

    #[test]
    fn data_envelope_is_unwrapped() {
        assert_eq!(unwrap_data(json!({"data": {"id": "x"}})), json!({"id": "x"}));
        assert_eq!(unwrap_data(json!({"id": "x"})), json!({"id": "x"}));
    }

    #[tokio::test]
    async fn create_call_sends_bearer_and_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calls"))
            .and(header("authorization", "Bearer uv_key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "uv_call_1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server)
            .create_call(&CreateCallRequest {
                agent_id: Some("uv_agent".into()),
                phone_number: "+15551234567".into(),
                direction: "outbound".into(),
                call_settings: json!({}),
                context: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(id, "uv_call_1");
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/corpora"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/corpora"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "corpus_1"})))
            .mount(&server)
            .await;

        let id = client(&server)
            .create_corpus(&CreateCorpusRequest {
                name: "Docs".into(),
                description: None,
                language: "en-US".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, "corpus_1");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/tools/t1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "no such tool"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).delete_tool("t1").await.unwrap_err();
        match err {
            UltravoxError::Api { status, message, .. } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such tool");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn persistent_rate_limiting_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server)
            .create_tool(&ToolDefinition {
                name: "lookup".into(),
                description: None,
                endpoint: "https://example.com".into(),
                method: "GET".into(),
                authentication: json!({}),
                parameters: json!({}),
                response_schema: json!({}),
            })
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert!(matches!(err, UltravoxError::Api { retry_after: Some(7), .. }));
    }

    #[tokio::test]
    async fn batch_ids_are_collected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/uv_agent/scheduled-batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"batches": [{"batch_id": "b1"}, {"batch_id": "b2"}]}}),
            ))
            .mount(&server)
            .await;

        let response = client(&server)
            .create_scheduled_batch("uv_agent", &ScheduledBatchRequest { batches: vec![] })
            .await
            .unwrap();
        assert_eq!(response.batch_ids(), vec!["b1", "b2"]);
    }
}
