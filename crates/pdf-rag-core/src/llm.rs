//! LLM provider trait.
//!
//! The query pipeline hands a fully rendered prompt to an [`LlmProvider`]
//! and uses the returned text verbatim as the answer. HTTP-backed
//! implementations live in the `pdf-rag` app crate.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}
