//! HTTP narrative generator
//!
//! Talks to any OpenAI-compatible chat-completions endpoint. Rate-limited
//! requests are retried with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::{debug, info, warn};

use super::types::{ChatRequest, ChatResponse, Message};
use crate::config::NarrativeConfig;
use crate::domain::graph::{Narrative, NarrativeGenerator, NarrativePrompt};
use crate::error::{Error, Result};

/// Maximum number of attempts for rate-limited requests
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound on a server-suggested wait before giving up on a retry
const MAX_SUGGESTED_WAIT_SECS: u64 = 60;

const SYSTEM_PROMPT: &str = "You write short, factual briefings about a knowledge graph. \
Use only the facts you are given. Start with a one-sentence summary on its own line, \
then a blank line, then the body.";

/// Narrative generator backed by a chat-completions API
#[derive(Clone)]
pub struct HttpNarrativeGenerator {
    http_client: HttpClient,
    config: NarrativeConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for HttpNarrativeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNarrativeGenerator")
            .field("base_url", &self.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

/// Builder for [`HttpNarrativeGenerator`]
#[derive(Default)]
pub struct HttpNarrativeGeneratorBuilder {
    config: Option<NarrativeConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl HttpNarrativeGeneratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NarrativeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the configured endpoint
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn build(self) -> Result<HttpNarrativeGenerator> {
        let config = self.config.unwrap_or_default();
        let api_key = match self.api_key {
            Some(key) => key,
            None => config
                .resolved_api_key()
                .map_err(|e| Error::ConfigError(e.to_string()))?
                .ok_or_else(|| {
                    Error::ConfigError(
                        "No narrative API key. Set LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY."
                            .to_string(),
                    )
                })?,
        };
        let base_url = self
            .base_url
            .unwrap_or_else(|| config.endpoint.clone())
            .trim_end_matches('/')
            .to_string();

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        info!(base_url = %base_url, model = %config.model, "Narrative client initialized");

        Ok(HttpNarrativeGenerator {
            http_client,
            config,
            api_key,
            base_url,
        })
    }
}

impl HttpNarrativeGenerator {
    pub fn builder() -> HttpNarrativeGeneratorBuilder {
        HttpNarrativeGeneratorBuilder::new()
    }

    /// Generator using the config and the API key from the environment
    pub fn from_config(config: &NarrativeConfig) -> Result<Self> {
        Self::builder().config(config.clone()).build()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_for(&self, prompt: &NarrativePrompt) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![Message::system(SYSTEM_PROMPT), Message::user(render_prompt(prompt))],
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
        }
    }

    async fn execute_request(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.send_request(request).await {
                Ok(response) => return Ok(response),
                Err(Error::RateLimited(wait_secs)) if attempts < MAX_RETRY_ATTEMPTS => {
                    let backoff = calculate_backoff(attempts, wait_secs);
                    warn!(
                        attempt = attempts,
                        wait_ms = backoff,
                        "Narrative service rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_request(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, messages = request.messages.len(), "Sending narrative request");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Linkweave")
            .json(request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::NarrativeFailed(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl NarrativeGenerator for HttpNarrativeGenerator {
    async fn generate(&self, prompt: &NarrativePrompt) -> Result<Narrative> {
        let request = self.request_for(prompt);
        let response = self.execute_request(&request).await?;
        let content = response
            .content()
            .ok_or_else(|| Error::NarrativeFailed("Empty response from narrative service".into()))?;
        Ok(split_narrative(content))
    }
}

/// User message sent to the narrative service
pub fn render_prompt(prompt: &NarrativePrompt) -> String {
    let mut out = format!("Title: {}\n", prompt.title);
    match (&prompt.subject, &prompt.subject_label) {
        (Some(_), Some(label)) => out.push_str(&format!("Subject: {}\n", label)),
        (Some(subject), None) => out.push_str(&format!("Subject: {}\n", subject)),
        (None, _) => out.push_str("Subject: the whole graph\n"),
    }
    match (prompt.period_start, prompt.period_end) {
        (Some(start), Some(end)) => out.push_str(&format!("Period: {} to {}\n", start, end)),
        (Some(start), None) => out.push_str(&format!("Period: from {}\n", start)),
        (None, Some(end)) => out.push_str(&format!("Period: until {}\n", end)),
        (None, None) => {}
    }
    if prompt.context.is_empty() {
        out.push_str("\nNo related items are known yet.\n");
    } else {
        out.push_str("\nRelated items:\n");
        for line in &prompt.context {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }
    if let Some(guidance) = prompt.guidance.as_deref().filter(|g| !g.trim().is_empty()) {
        out.push_str(&format!("\nGuidance: {}\n", guidance.trim()));
    }
    out
}

/// First paragraph becomes the summary when more than one paragraph came back
pub fn split_narrative(content: &str) -> Narrative {
    let content = content.trim();
    match content.split_once("\n\n") {
        Some((summary, rest)) if !rest.trim().is_empty() => Narrative {
            summary: Some(summary.trim().to_string()),
            body: rest.trim().to_string(),
        },
        _ => Narrative {
            summary: None,
            body: content.to_string(),
        },
    }
}

fn error_for_status(status: u16, body: &str) -> Error {
    match status {
        401 => Error::NarrativeFailed(
            "Unauthorized: invalid API key. Set LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY."
                .to_string(),
        ),
        429 => Error::RateLimited(extract_retry_after(body).unwrap_or(0)),
        400 => Error::NarrativeFailed(format!("Bad request: {}", body)),
        404 => Error::NarrativeFailed(format!("Model or endpoint not found: {}", body)),
        500..=599 => Error::NarrativeFailed(format!("Server error ({}): {}", status, body)),
        _ => Error::NarrativeFailed(format!("HTTP error {}: {}", status, body)),
    }
}

/// Exponential backoff, stretched to a server-suggested wait when given
fn calculate_backoff(attempt: u32, suggested_wait_secs: u64) -> u64 {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    base.max(suggested_wait_secs.min(MAX_SUGGESTED_WAIT_SECS) * 1000)
}

fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{NodeRef, NodeType};
    use chrono::NaiveDate;

    fn test_config() -> NarrativeConfig {
        NarrativeConfig {
            model: "test/model".to_string(),
            ..NarrativeConfig::default()
        }
    }

    #[test]
    fn test_builder_with_explicit_key() {
        let client = HttpNarrativeGenerator::builder()
            .config(test_config())
            .api_key("test-key")
            .base_url("https://example.com/v1/")
            .build()
            .unwrap();
        assert_eq!(client.model(), "test/model");
        assert_eq!(client.base_url, "https://example.com/v1");

        let debug = format!("{:?}", client);
        assert!(debug.contains("test/model"));
        assert!(!debug.contains("test-key"));
    }

    #[test]
    fn test_builder_rejects_key_in_config() {
        let mut config = test_config();
        config.api_key = Some("stored".into());
        let err = HttpNarrativeGenerator::builder().config(config).build().unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_render_prompt() {
        let prompt = NarrativePrompt {
            title: "Bank X brief".into(),
            subject: Some(NodeRef::new(NodeType::Entity, "bank-x")),
            subject_label: Some("Bank X".into()),
            period_start: NaiveDate::from_ymd_opt(2025, 1, 1),
            period_end: NaiveDate::from_ymd_opt(2025, 3, 31),
            context: vec!["Mentioned in this document: Q3 Report".into()],
            guidance: Some("  Keep it short ".into()),
        };
        let text = render_prompt(&prompt);
        assert!(text.contains("Subject: Bank X\n"));
        assert!(text.contains("Period: 2025-01-01 to 2025-03-31"));
        assert!(text.contains("- Mentioned in this document: Q3 Report\n"));
        assert!(text.ends_with("Guidance: Keep it short\n"));

        let overview = NarrativePrompt {
            subject: None,
            subject_label: None,
            period_start: None,
            period_end: None,
            context: vec![],
            guidance: None,
            ..prompt
        };
        let text = render_prompt(&overview);
        assert!(text.contains("the whole graph"));
        assert!(text.contains("No related items"));
        assert!(!text.contains("Period"));
    }

    #[test]
    fn test_split_narrative() {
        let n = split_narrative("Bank X grew.\n\nDeposits rose in Q3.\n\nLoans were flat.");
        assert_eq!(n.summary.as_deref(), Some("Bank X grew."));
        assert_eq!(n.body, "Deposits rose in Q3.\n\nLoans were flat.");

        let single = split_narrative("  Only one paragraph.  ");
        assert!(single.summary.is_none());
        assert_eq!(single.body, "Only one paragraph.");
    }

    #[test]
    fn test_parse_chat_response() {
        let json = r#"{"id":"x","model":"test/model","choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.content(), Some("Hello"));

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(empty.content().is_none());
    }

    #[test]
    fn test_status_mapping_and_backoff() {
        assert!(matches!(
            error_for_status(429, r#"{"error":{"retry_after":5}}"#),
            Error::RateLimited(5)
        ));
        assert!(matches!(error_for_status(429, "busy"), Error::RateLimited(0)));
        assert!(matches!(error_for_status(503, ""), Error::NarrativeFailed(_)));

        assert_eq!(calculate_backoff(1, 0), 1000);
        assert_eq!(calculate_backoff(3, 0), 4000);
        assert_eq!(calculate_backoff(1, 5), 5000);
        assert_eq!(calculate_backoff(1, 600), 60_000);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpNarrativeGenerator>();
    }
}
