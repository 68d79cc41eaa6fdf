//! Narrative generation backends
//!
//! - `client`: chat-completions HTTP client with rate-limit retry
//! - `types`: request/response wire types

mod client;
mod types;

use async_trait::async_trait;

use crate::config::NarrativeConfig;
use crate::domain::graph::{Narrative, NarrativeGenerator, NarrativePrompt};
use crate::error::{Error, Result};

pub use client::{HttpNarrativeGenerator, HttpNarrativeGeneratorBuilder, render_prompt, split_narrative};
pub use types::{ChatRequest, ChatResponse, Choice, Message, MessageRole};

/// Generator used when no API key is available; every story fails with a hint
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl NarrativeGenerator for UnconfiguredGenerator {
    async fn generate(&self, _prompt: &NarrativePrompt) -> Result<Narrative> {
        Err(Error::NarrativeFailed(
            "no API key configured; set LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY".into(),
        ))
    }
}

/// HTTP generator when a key is present, otherwise [`UnconfiguredGenerator`]
pub fn generator_from_config(config: &NarrativeConfig) -> Result<std::sync::Arc<dyn NarrativeGenerator>> {
    let key = config
        .resolved_api_key()
        .map_err(|e| Error::ConfigError(e.to_string()))?;
    Ok(match key {
        Some(key) => std::sync::Arc::new(
            HttpNarrativeGenerator::builder()
                .config(config.clone())
                .api_key(key)
                .build()?,
        ),
        None => {
            tracing::debug!("No narrative API key set, story generation disabled");
            std::sync::Arc::new(UnconfiguredGenerator)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_generator_fails_with_hint() {
        let prompt = NarrativePrompt {
            title: "t".into(),
            subject: None,
            subject_label: None,
            period_start: None,
            period_end: None,
            context: vec![],
            guidance: None,
        };
        let err = UnconfiguredGenerator.generate(&prompt).await.unwrap_err();
        assert!(err.to_string().contains("LINKWEAVE_NARRATIVE_API_KEY"));
    }
}
