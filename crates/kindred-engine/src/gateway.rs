use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use thiserror::Error;

use kindred_contracts::settings::ApiSettings;

pub const API_VERSION_SEGMENT: &str = "/v1";
pub const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

/// Error bodies shown to the user are clipped to this many characters.
pub const HTTP_SNIPPET_MAX_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API settings incomplete: {field} is empty; fill it in before generating")]
    Configuration { field: &'static str },
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("HTTP {status}: {snippet}")]
    Http { status: u16, snippet: String },
    #[error("response contained no assistant text")]
    MalformedResponse,
    #[error("network error: {0}")]
    Transport(String),
}

/// Assistant text plus whether the provider stopped on the token limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOutcome {
    pub text: String,
    pub truncated: bool,
}

/// Appends `/v1/chat/completions` onto a configured base endpoint,
/// tolerating bases that already carry part of the path. Idempotent.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with(CHAT_COMPLETIONS_SUFFIX) {
        return trimmed.to_string();
    }
    if trimmed.ends_with(API_VERSION_SEGMENT) {
        return format!("{trimmed}{CHAT_COMPLETIONS_SUFFIX}");
    }
    format!("{trimmed}{API_VERSION_SEGMENT}{CHAT_COMPLETIONS_SUFFIX}")
}

/// The `/v1/models` URL for the same base endpoint.
pub fn models_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with(API_VERSION_SEGMENT) {
        return format!("{trimmed}/models");
    }
    format!("{trimmed}{API_VERSION_SEGMENT}/models")
}

/// Transport seam: the pipeline and gateway are tested against scripted
/// implementations; production uses [`HttpTransport`].
pub trait ChatTransport: Send + Sync {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;

    fn get_json(&self, url: &str, api_key: &str, timeout: Duration)
        -> Result<Value, GatewayError>;
}

#[derive(Debug, Default)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl ChatTransport for HttpTransport {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .timeout(timeout)
            .send()
            .map_err(|err| classify_send_error(err, timeout))?;
        read_json_or_http_error(response)
    }

    fn get_json(
        &self,
        url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let mut request = self.http.get(url).timeout(timeout);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .map_err(|err| classify_send_error(err, timeout))?;
        read_json_or_http_error(response)
    }
}

fn classify_send_error(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            seconds: timeout.as_secs(),
        }
    } else {
        GatewayError::Transport(err.to_string())
    }
}

fn read_json_or_http_error(response: HttpResponse) -> Result<Value, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            snippet: error_snippet(&body),
        });
    }
    response
        .json::<Value>()
        .map_err(|_| GatewayError::MalformedResponse)
}

/// Prefers the provider's structured error message when the body is JSON,
/// then clips to a displayable length.
pub fn error_snippet(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| {
            let error = parsed.get("error")?.clone();
            match error {
                Value::String(text) => Some(text),
                Value::Object(map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }
        })
        .unwrap_or_else(|| body.trim().to_string());
    truncate_chars(&message, HTTP_SNIPPET_MAX_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push('…');
    clipped
}

/// Client for an OpenAI-compatible chat-completion endpoint. Settings are
/// validated before any network attempt; no automatic retries.
pub struct ChatGateway {
    transport: Box<dyn ChatTransport>,
}

impl ChatGateway {
    pub fn new(transport: Box<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    pub fn http() -> Self {
        Self::new(Box::new(HttpTransport::new()))
    }

    pub fn call_chat_completion(
        &self,
        settings: &ApiSettings,
        prompt: &str,
    ) -> Result<ChatOutcome, GatewayError> {
        if let Some(field) = settings.missing_field() {
            return Err(GatewayError::Configuration { field });
        }

        let url = normalize_endpoint(&settings.endpoint);
        let body = json!({
            "model": settings.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": settings.temperature,
            "max_tokens": settings.max_tokens,
            "stream": false,
        });
        let payload = self.transport.post_json(
            &url,
            &settings.api_key,
            &body,
            Duration::from_secs(settings.timeout_seconds),
        )?;

        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or(GatewayError::MalformedResponse)?;
        let text = choice
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(GatewayError::MalformedResponse)?;
        let truncated = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(|reason| reason == "length")
            .unwrap_or(false);

        Ok(ChatOutcome {
            text: text.to_string(),
            truncated,
        })
    }

    /// Lists the models the endpoint serves. Accepts `{data:[..]}`,
    /// `{models:[..]}` and bare-array layouts; entries may be id strings or
    /// objects carrying `id`/`name`.
    pub fn fetch_models(&self, settings: &ApiSettings) -> Result<Vec<String>, GatewayError> {
        if settings.endpoint.trim().is_empty() {
            return Err(GatewayError::Configuration { field: "endpoint" });
        }

        let url = models_endpoint(&settings.endpoint);
        let payload = self.transport.get_json(
            &url,
            &settings.api_key,
            Duration::from_secs(settings.timeout_seconds),
        )?;

        let rows = payload
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| payload.get("models").and_then(Value::as_array))
            .or_else(|| payload.as_array())
            .ok_or(GatewayError::MalformedResponse)?;

        let mut models = Vec::new();
        for row in rows {
            let id = match row {
                Value::String(id) => Some(id.trim().to_string()),
                Value::Object(map) => map
                    .get("id")
                    .or_else(|| map.get("name"))
                    .and_then(Value::as_str)
                    .map(|id| id.trim().to_string()),
                _ => None,
            };
            if let Some(id) = id.filter(|id| !id.is_empty()) {
                if !models.contains(&id) {
                    models.push(id);
                }
            }
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    struct ScriptedTransport {
        calls: Arc<AtomicUsize>,
        reply: Result<Value, GatewayError>,
    }

    impl ScriptedTransport {
        fn returning(reply: Result<Value, GatewayError>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: Arc::clone(&calls),
                    reply,
                },
                calls,
            )
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn post_json(
            &self,
            _url: &str,
            _api_key: &str,
            _body: &Value,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            clone_reply(&self.reply)
        }

        fn get_json(
            &self,
            _url: &str,
            _api_key: &str,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            clone_reply(&self.reply)
        }
    }

    fn clone_reply(reply: &Result<Value, GatewayError>) -> Result<Value, GatewayError> {
        match reply {
            Ok(value) => Ok(value.clone()),
            Err(GatewayError::Configuration { field }) => {
                Err(GatewayError::Configuration { field })
            }
            Err(GatewayError::Timeout { seconds }) => Err(GatewayError::Timeout {
                seconds: *seconds,
            }),
            Err(GatewayError::Http { status, snippet }) => Err(GatewayError::Http {
                status: *status,
                snippet: snippet.clone(),
            }),
            Err(GatewayError::MalformedResponse) => Err(GatewayError::MalformedResponse),
            Err(GatewayError::Transport(message)) => {
                Err(GatewayError::Transport(message.clone()))
            }
        }
    }

    fn settings() -> ApiSettings {
        ApiSettings {
            endpoint: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-test".to_string(),
            ..ApiSettings::default()
        }
    }

    fn chat_payload(content: &str) -> Value {
        json!({"choices": [{"message": {"content": content}, "finish_reason": "stop"}]})
    }

    #[test]
    fn normalize_appends_version_and_completions_path() {
        assert_eq!(
            normalize_endpoint("https://api.example.com"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint("https://api.example.com///"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "",
            "https://api.example.com",
            "https://api.example.com/v1",
            "https://api.example.com/v1/chat/completions",
            "https://proxy.example.com/openai/",
        ] {
            let once = normalize_endpoint(raw);
            assert_eq!(normalize_endpoint(&once), once, "input: {raw:?}");
            assert!(once.ends_with(CHAT_COMPLETIONS_SUFFIX), "input: {raw:?}");
        }
    }

    #[test]
    fn models_endpoint_reuses_version_segment() {
        assert_eq!(
            models_endpoint("https://api.example.com"),
            "https://api.example.com/v1/models"
        );
        assert_eq!(
            models_endpoint("https://api.example.com/v1/"),
            "https://api.example.com/v1/models"
        );
    }

    #[test]
    fn missing_settings_fail_before_any_network_call() {
        let (transport, calls) = ScriptedTransport::returning(Ok(chat_payload("hi")));
        let gateway = ChatGateway::new(Box::new(transport));
        let mut bad = settings();
        bad.endpoint = String::new();

        let err = gateway
            .call_chat_completion(&bad, "prompt")
            .expect_err("must fail");
        assert!(matches!(
            err,
            GatewayError::Configuration { field: "endpoint" }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn extracts_assistant_text() {
        let (transport, calls) = ScriptedTransport::returning(Ok(chat_payload("你好")));
        let gateway = ChatGateway::new(Box::new(transport));
        let outcome = gateway
            .call_chat_completion(&settings(), "prompt")
            .expect("ok");
        assert_eq!(outcome.text, "你好");
        assert!(!outcome.truncated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_reason_length_marks_truncation() {
        let payload =
            json!({"choices": [{"message": {"content": "部分"}, "finish_reason": "length"}]});
        let (transport, _calls) = ScriptedTransport::returning(Ok(payload));
        let gateway = ChatGateway::new(Box::new(transport));
        let outcome = gateway
            .call_chat_completion(&settings(), "prompt")
            .expect("ok");
        assert!(outcome.truncated);
    }

    #[test]
    fn empty_assistant_text_is_malformed() {
        for payload in [
            json!({"choices": []}),
            json!({"choices": [{"message": {}}]}),
            json!({"choices": [{"message": {"content": "   "}}]}),
            json!({"ok": true}),
        ] {
            let (transport, _calls) = ScriptedTransport::returning(Ok(payload));
            let gateway = ChatGateway::new(Box::new(transport));
            let err = gateway
                .call_chat_completion(&settings(), "prompt")
                .expect_err("must fail");
            assert!(matches!(err, GatewayError::MalformedResponse));
        }
    }

    #[test]
    fn http_errors_pass_through() {
        let (transport, _calls) = ScriptedTransport::returning(Err(GatewayError::Http {
            status: 429,
            snippet: "rate limited".to_string(),
        }));
        let gateway = ChatGateway::new(Box::new(transport));
        let err = gateway
            .call_chat_completion(&settings(), "prompt")
            .expect_err("must fail");
        match err {
            GatewayError::Http { status, snippet } => {
                assert_eq!(status, 429);
                assert_eq!(snippet, "rate limited");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_snippet_prefers_provider_message() {
        assert_eq!(
            error_snippet(r#"{"error":{"message":"invalid api key"}}"#),
            "invalid api key"
        );
        assert_eq!(error_snippet(r#"{"error":"quota exceeded"}"#), "quota exceeded");
        assert_eq!(error_snippet("plain text body"), "plain text body");
    }

    #[test]
    fn error_snippet_is_clipped() {
        let long = "x".repeat(HTTP_SNIPPET_MAX_CHARS + 50);
        let snippet = error_snippet(&long);
        assert_eq!(snippet.chars().count(), HTTP_SNIPPET_MAX_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn fetch_models_accepts_all_known_layouts() {
        for payload in [
            json!({"data": [{"id": "gpt-a"}, {"id": "gpt-b"}]}),
            json!({"models": ["gpt-a", {"name": "gpt-b"}]}),
            json!([{"id": "gpt-a"}, "gpt-b", "gpt-a"]),
        ] {
            let (transport, _calls) = ScriptedTransport::returning(Ok(payload));
            let gateway = ChatGateway::new(Box::new(transport));
            let models = gateway.fetch_models(&settings()).expect("ok");
            assert_eq!(models, vec!["gpt-a".to_string(), "gpt-b".to_string()]);
        }
    }

    #[test]
    fn fetch_models_requires_endpoint_only() {
        let (transport, calls) =
            ScriptedTransport::returning(Ok(json!({"data": [{"id": "gpt-a"}]})));
        let gateway = ChatGateway::new(Box::new(transport));
        let mut partial = settings();
        partial.api_key = String::new();
        partial.model = String::new();
        assert!(gateway.fetch_models(&partial).is_ok());

        partial.endpoint = String::new();
        let err = gateway.fetch_models(&partial).expect_err("must fail");
        assert!(matches!(
            err,
            GatewayError::Configuration { field: "endpoint" }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
