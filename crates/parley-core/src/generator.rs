//! Bot text generation.

use async_trait::async_trait;
use thiserror::Error;

/// Text generation errors.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("chatbot is not configured")]
    Disabled,

    #[error("chatbot failed to answer: {0}")]
    Failed(String),
}

/// Produces the bot's answer to a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Generator used when no model is configured. Always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_generator_fails() {
        let err = DisabledGenerator.generate("hello").await.unwrap_err();
        assert_eq!(err.to_string(), "chatbot is not configured");
    }
}
