pub mod gemini;

pub use gemini::GeminiClient;

use async_trait::async_trait;
use serde_json::Value;

/// Seam over the model API so the agent loop is testable without a network.
///
/// `contents` and the returned parts are raw JSON values: provider turns are
/// stored and replayed verbatim, preserving opaque fields such as
/// `thoughtSignature`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// One `generateContent` round-trip; returns the candidate's parts.
    async fn generate(
        &self,
        system: Option<&str>,
        contents: &[Value],
        tools: &[Value],
    ) -> anyhow::Result<Vec<Value>>;

    /// Grounded web search, answered as plain text.
    async fn google_search(&self, query: &str) -> anyhow::Result<String>;
}
