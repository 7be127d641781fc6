pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A completed model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Text-completion backend used for grading and prompt authoring.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// `context` carries system messages, sent ahead of `prompt`.
    async fn complete(&self, prompt: &str, context: Option<&[String]>)
        -> anyhow::Result<LlmResponse>;

    fn provider_name(&self) -> &'static str;
}
