//! Google Gemini `generateContent` client used inside the agent sandbox.
//!
//! History turns are sent and received as raw JSON parts; the client never
//! re-shapes model output, so opaque provider fields round-trip intact.

use super::ModelClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_OUTPUT_TOKENS: u32 = 8192;

pub struct GeminiClient {
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Resolve credentials from the injected sandbox environment.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .context("GEMINI_API_KEY is not set")?;
        let model = std::env::var("GEMINI_MODEL")
            .ok()
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());
        Ok(Self::new(api_key, model))
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Keep the query-string credential out of surfaced error text.
    fn sanitize(&self, text: &str) -> String {
        text.replace(&self.api_key, "[redacted]")
    }

    async fn call(&self, request: &Value) -> Result<Vec<Value>> {
        let url = format!(
            "{API_BASE}/{}:generateContent?key={}",
            self.model_path(),
            self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|error| anyhow::anyhow!("Gemini request failed: {}", self.sanitize(&error.to_string())))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error ({status}): {}", self.sanitize(&body));
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to decode Gemini response")?;

        if let Some(error) = result.error {
            anyhow::bail!("Gemini API error: {}", self.sanitize(&error.message));
        }

        let parts = result
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();

        if parts.is_empty() {
            anyhow::bail!("No response from Gemini");
        }
        Ok(parts)
    }

    fn build_request(system: Option<&str>, contents: &[Value], tools: &[Value]) -> Value {
        let mut request = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
            },
        });
        if let Some(system) = system {
            request["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() {
            request["tools"] = json!(tools);
        }
        request
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(
        &self,
        system: Option<&str>,
        contents: &[Value],
        tools: &[Value],
    ) -> Result<Vec<Value>> {
        let request = Self::build_request(system, contents, tools);
        self.call(&request).await
    }

    async fn google_search(&self, query: &str) -> Result<String> {
        let request = json!({
            "contents": [{ "role": "user", "parts": [{ "text": query }] }],
            "tools": [{ "google_search": {} }],
            "generationConfig": { "maxOutputTokens": MAX_OUTPUT_TOKENS },
        });
        let parts = self.call(&request).await?;

        let text: Vec<&str> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            anyhow::bail!("search returned no text");
        }
        Ok(text.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_passes_contents_verbatim() {
        let contents = vec![json!({
            "role": "model",
            "parts": [{ "text": "hi", "thoughtSignature": "opaque-blob" }],
        })];
        let request = GeminiClient::build_request(Some("be brief"), &contents, &[]);

        assert_eq!(
            request["contents"][0]["parts"][0]["thoughtSignature"],
            "opaque-blob"
        );
        assert_eq!(request["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(request.get("tools").is_none());
    }

    #[test]
    fn request_includes_tools_when_present() {
        let tools = vec![json!({ "functionDeclarations": [{ "name": "bash" }] })];
        let request = GeminiClient::build_request(None, &[], &tools);
        assert_eq!(request["tools"][0]["functionDeclarations"][0]["name"], "bash");
        assert!(request.get("systemInstruction").is_none());
    }

    #[test]
    fn model_path_is_prefixed_once() {
        let client = GeminiClient::new("k", "gemini-2.5-flash");
        assert_eq!(client.model_path(), "models/gemini-2.5-flash");

        let prefixed = GeminiClient::new("k", "models/gemini-2.5-pro");
        assert_eq!(prefixed.model_path(), "models/gemini-2.5-pro");
    }

    #[test]
    fn sanitize_redacts_api_key() {
        let client = GeminiClient::new("sk-super-secret", "m");
        let sanitized = client.sanitize("error for key sk-super-secret in url");
        assert!(!sanitized.contains("sk-super-secret"));
        assert!(sanitized.contains("[redacted]"));
    }
}
