//! LLM API interaction with optional backoff retry.
//!
//! This module provides the interface used by the classifier to talk to an
//! OpenAI-compatible chat-completions API.
//!
//! # Architecture
//!
//! - [`AskAsync`]: Core trait defining async LLM interaction
//! - [`ChatClient`]: `reqwest` implementation against `{endpoint}/chat/completions`
//! - [`RetryAsk`]: Decorator that adds retry logic to any `AskAsync` implementation
//!
//! # Retry Strategy
//!
//! An unavailable LLM is fatal for the run, so the default is a single
//! attempt. Operators can opt into `llm.max_retries` extra attempts; those
//! only cover transport failures and 5xx/429 replies, never a reply that was
//! received but could not be used.

use std::fmt;
use std::time::{Duration as StdDuration, Instant};

use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::config::LlmConfig;
use crate::error::ClassificationError;
use crate::utils::truncate_for_log;

/// A system + user message pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Trait for async LLM interaction.
///
/// Implementors send a prompt to an LLM and return the raw text of its reply.
pub trait AskAsync {
    async fn ask(&self, prompt: &Prompt) -> Result<String, ClassificationError>;
}

fn is_retriable(e: &ClassificationError) -> bool {
    match e {
        ClassificationError::Transport(e) => e.is_timeout() || e.is_connect(),
        ClassificationError::Status { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`AskAsync`] implementation.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryAsk<T> {
    /// The underlying LLM client to wrap.
    inner: T,
    /// Extra attempts after the first one.
    max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    base_delay: StdDuration,
    /// Maximum delay cap to prevent excessive waiting.
    max_delay: StdDuration,
}

impl<T> RetryAsk<T>
where
    T: AskAsync,
{
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryAsk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAsk")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> AskAsync for RetryAsk<T>
where
    T: AskAsync,
{
    #[instrument(level = "info", skip_all)]
    async fn ask(&self, prompt: &Prompt) -> Result<String, ClassificationError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.ask(prompt).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if !is_retriable(&e) || attempt >= self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "ask() failed"
                        );
                        return Err(e);
                    }
                    attempt += 1;

                    // backoff calc
                    let shift = (attempt - 1).min(16) as u32;
                    let mut delay = self.base_delay.saturating_mul(1 << shift);
                    if delay > self.max_delay {
                        delay = self.max_delay;
                    }
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "ask() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ClassificationError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Build a client whose key comes from the env var named in the config.
    pub fn from_env(config: &LlmConfig) -> Result<Self, ClassificationError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ClassificationError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }
}

impl AskAsync for ChatClient {
    #[instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn ask(&self, prompt: &Prompt) -> Result<String, ClassificationError> {
        let t0 = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassificationError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body, 300),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClassificationError::Schema("reply has no choices".into()))?;
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(ClassificationError::Truncated);
        }
        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ClassificationError::Schema("reply has no content".into()))?;

        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            bytes = content.len(),
            "LLM replied"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn llm_config(endpoint: &str) -> LlmConfig {
        LlmConfig {
            endpoint: endpoint.to_string(),
            model: "test-model".into(),
            api_key_env: "DIGEST_TEST_UNSET_KEY".into(),
            max_tokens: 512,
            temperature: 0.0,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".into(),
            user: "user".into(),
        }
    }

    fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason
            }]
        })
    }

    #[tokio::test]
    async fn chat_client_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"ok\":true}", "stop")))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(&llm_config(&format!("{}/v1/", server.uri())), "secret".into()).unwrap();
        let reply = client.ask(&prompt()).await.unwrap();
        assert_eq!(reply, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn length_cutoff_is_reported_as_truncation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"summary\": \"cut", "length")))
            .mount(&server)
            .await;

        let client = ChatClient::new(&llm_config(&server.uri()), "k".into()).unwrap();
        let err = client.ask(&prompt()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Truncated));
    }

    #[tokio::test]
    async fn http_errors_surface_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = ChatClient::new(&llm_config(&server.uri()), "k".into()).unwrap();
        match client.ask(&prompt()).await {
            Err(ClassificationError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn missing_api_key_is_reported_by_name() {
        let err = ChatClient::from_env(&llm_config("https://llm.example")).unwrap_err();
        assert!(matches!(err, ClassificationError::MissingApiKey(ref name) if name == "DIGEST_TEST_UNSET_KEY"));
    }

    struct Flaky {
        calls: AtomicUsize,
        error_status: u16,
    }

    impl AskAsync for Flaky {
        async fn ask(&self, _prompt: &Prompt) -> Result<String, ClassificationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClassificationError::Status {
                    status: self.error_status,
                    body: String::new(),
                })
            } else {
                Ok("fine".into())
            }
        }
    }

    #[tokio::test]
    async fn retry_ask_retries_server_errors_when_enabled() {
        let api = RetryAsk::new(
            Flaky {
                calls: AtomicUsize::new(0),
                error_status: 503,
            },
            1,
            StdDuration::from_millis(1),
        );
        assert_eq!(api.ask(&prompt()).await.unwrap(), "fine");
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_ask_with_zero_retries_fails_fast() {
        let api = RetryAsk::new(
            Flaky {
                calls: AtomicUsize::new(0),
                error_status: 503,
            },
            0,
            StdDuration::from_millis(1),
        );
        assert!(api.ask(&prompt()).await.is_err());
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_ask_does_not_retry_client_errors() {
        let api = RetryAsk::new(
            Flaky {
                calls: AtomicUsize::new(0),
                error_status: 400,
            },
            3,
            StdDuration::from_millis(1),
        );
        assert!(api.ask(&prompt()).await.is_err());
        assert_eq!(api.inner.calls.load(Ordering::SeqCst), 1);
    }
}
