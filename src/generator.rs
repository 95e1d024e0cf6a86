// =============================================================================
// generator.rs — NARRATIVE TEXT FROM A STRUCTURED SUMMARY
// =============================================================================
//
// The insight generator only needs "system instruction + prompt in, text
// out". `TextGenerator` is that seam, `GeminiClient` is the production
// implementation against the Generative Language REST API:
//
//   POST {base}/models/{model}:generateContent?key={api_key}
//
// Each attempt is bounded by the configured timeout. Timeouts, transport
// errors, 429 and 5xx are retried with linear backoff up to the attempt
// limit, and all of them count against the circuit breaker. Anything else
// fails immediately.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::error::GenerationError;
use crate::metrics::MetricsCollector;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_instruction: &str, prompt: &str)
        -> Result<String, GenerationError>;
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Concatenated text of the first candidate. Blank text counts as no text.
fn extract_text(body: &str) -> Result<String, GenerationError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|_| GenerationError::EmptyResponse)?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        Err(GenerationError::EmptyResponse)
    } else {
        Ok(text)
    }
}

// =============================================================================
// Gemini client
// =============================================================================

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsCollector>,
}

impl GeminiClient {
    pub fn from_config(
        config: &Config,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("campaign-batch-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let breaker = Arc::new(CircuitBreaker::new(
            "gemini",
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_reset_timeout,
            config.circuit_breaker_success_threshold,
        ));

        if config.gemini_api_key.is_none() {
            warn!("No Gemini API key configured, insight requests will fail");
        }

        Ok(Self {
            http,
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
            timeout: config.generation_timeout,
            max_attempts: config.generation_max_attempts.max(1),
            retry_backoff: Duration::from_millis(500),
            breaker,
            metrics,
        })
    }

    /// Base delay between attempts. Attempt `n` waits `n * backoff`.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    async fn attempt(&self, api_key: &str, body: &GenerateRequest<'_>) -> Result<String, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }
        extract_text(&text)
    }

    fn record_failure(&self) {
        let was_open = self.breaker.state() == CircuitState::Open;
        self.breaker.record_failure();
        if !was_open && self.breaker.state() == CircuitState::Open {
            self.metrics.increment_breaker_trips();
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(
        &self,
        system_instruction: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::NotConfigured)?;
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: system_instruction }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
        };

        let mut attempt = 1;
        loop {
            if !self.breaker.allow_request() {
                return Err(GenerationError::CircuitOpen(self.breaker.name().to_string()));
            }

            let result = match tokio::time::timeout(self.timeout, self.attempt(api_key, &body)).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(self.timeout.as_secs())),
            };

            match result {
                Ok(text) => {
                    self.breaker.record_success();
                    info!(model = %self.model, attempt, chars = text.len(), "Narrative generated");
                    return Ok(text);
                }
                Err(e) if e.is_retryable() => {
                    self.record_failure();
                    if attempt >= self.max_attempts {
                        warn!(model = %self.model, attempts = attempt, error = %e, "Generation attempts exhausted");
                        return Err(e);
                    }
                    warn!(model = %self.model, attempt, error = %e, "Generation failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(model = %self.model, error = %e, "Generation failed permanently");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, attempts: u32, timeout: Duration) -> GeminiClient {
        let config = Config {
            gemini_api_key: Some("test-key".into()),
            gemini_base_url: server.uri(),
            generation_max_attempts: attempts,
            generation_timeout: timeout,
            circuit_breaker_failure_threshold: 10,
            ..Config::default()
        };
        GeminiClient::from_config(&config, Arc::new(MetricsCollector::new()))
            .unwrap()
            .with_retry_backoff(Duration::ZERO)
    }

    fn reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }]
        })
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"Deliveries "},{"text":"are up."}]}}]}"#;
        assert_eq!(extract_text(body).unwrap(), "Deliveries are up.");
        assert!(matches!(extract_text(r#"{"candidates":[]}"#), Err(GenerationError::EmptyResponse)));
        assert!(matches!(extract_text("<html>"), Err(GenerationError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_generate_posts_instruction_and_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "systemInstruction": { "parts": [{ "text": "be brief" }] },
                "contents": [{ "role": "user", "parts": [{ "text": "{\"a\":1}" }] }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("All good.")))
            .expect(1)
            .mount(&server)
            .await;

        let text = client(&server, 3, Duration::from_secs(5))
            .generate("be brief", "{\"a\":1}")
            .await
            .unwrap();
        assert_eq!(text, "All good.");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("Recovered.")))
            .mount(&server)
            .await;

        let text = client(&server, 3, Duration::from_secs(5))
            .generate("sys", "prompt")
            .await
            .unwrap();
        assert_eq!(text, "Recovered.");
    }

    #[tokio::test]
    async fn test_client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, 3, Duration::from_secs(5))
            .generate("sys", "prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_timeout_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("late"))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server, 2, Duration::from_millis(50))
            .generate("sys", "prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_not_configured() {
        let config = Config { gemini_api_key: None, ..Config::default() };
        let client = GeminiClient::from_config(&config, Arc::new(MetricsCollector::new())).unwrap();
        assert!(matches!(
            client.generate("sys", "prompt").await,
            Err(GenerationError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_refuses_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = Config {
            gemini_api_key: Some("test-key".into()),
            gemini_base_url: server.uri(),
            generation_max_attempts: 1,
            circuit_breaker_failure_threshold: 1,
            ..Config::default()
        };
        let metrics = Arc::new(MetricsCollector::new());
        let client = GeminiClient::from_config(&config, metrics.clone()).unwrap();

        assert!(matches!(
            client.generate("sys", "prompt").await,
            Err(GenerationError::Status { status: 500, .. })
        ));
        assert!(matches!(
            client.generate("sys", "prompt").await,
            Err(GenerationError::CircuitOpen(_))
        ));
        assert_eq!(metrics.snapshot().generator_breaker_trips, 1);
    }
}
