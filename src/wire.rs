//! Host ↔ sandbox wire contract: the JSON payload written to the agent's
//! stdin, the framed JSON block parsed from its stdout, and the framing
//! markers themselves.

use serde::{Deserialize, Serialize};

pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

// ── Host → sandbox ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub channel_id: String,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<InputImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputImage {
    pub name: String,
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

// ── Sandbox → host ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: OutputStatus,
    pub result: Option<AgentResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub output_type: OutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Message,
    Log,
}

impl ContainerOutput {
    pub fn success(result: AgentResponse, new_session_id: Option<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result: Some(result),
            new_session_id,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Wrap a [`ContainerOutput`] in the framing markers for stdout emission.
pub fn emit_framed(output: &ContainerOutput) -> anyhow::Result<String> {
    let json = serde_json::to_string(output)?;
    Ok(format!(
        "{OUTPUT_START_MARKER}\n{json}\n{OUTPUT_END_MARKER}\n"
    ))
}

/// Extract the [`ContainerOutput`] from raw agent stdout.
///
/// Only the content between the last matching pair of markers is parsed;
/// anything else on stdout is noise (agent logs, tool chatter).
pub fn parse_framed(stdout: &str) -> Option<anyhow::Result<ContainerOutput>> {
    let end = stdout.rfind(OUTPUT_END_MARKER)?;
    let start = stdout[..end].rfind(OUTPUT_START_MARKER)?;
    let body = stdout[start + OUTPUT_START_MARKER.len()..end].trim();
    Some(serde_json::from_str(body).map_err(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> ContainerOutput {
        ContainerOutput::success(
            AgentResponse {
                output_type: OutputType::Message,
                user_message: Some("hi".into()),
                internal_log: None,
            },
            Some("s1".into()),
        )
    }

    #[test]
    fn input_serializes_camel_case() {
        let input = ContainerInput {
            prompt: "hello".into(),
            session_id: None,
            group_folder: "g1".into(),
            channel_id: "C1".into(),
            is_main: false,
            is_scheduled_task: false,
            images: Vec::new(),
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["groupFolder"], "g1");
        assert_eq!(json["channelId"], "C1");
        assert_eq!(json["isMain"], false);
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn output_parses_success_payload() {
        let raw = r#"{"status":"success","result":{"outputType":"message","userMessage":"hi"},"newSessionId":"s1"}"#;
        let output: ContainerOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(output.status, OutputStatus::Success);
        let result = output.result.unwrap();
        assert_eq!(result.output_type, OutputType::Message);
        assert_eq!(result.user_message.as_deref(), Some("hi"));
        assert_eq!(output.new_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn framed_round_trip() {
        let framed = emit_framed(&sample_output()).unwrap();
        let parsed = parse_framed(&framed).unwrap().unwrap();
        assert_eq!(parsed.status, OutputStatus::Success);
        assert_eq!(parsed.new_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn parse_ignores_noise_and_uses_last_pair() {
        let first = emit_framed(&ContainerOutput::failure("stale")).unwrap();
        let second = emit_framed(&sample_output()).unwrap();
        let stdout = format!("debug noise\n{first}\nmore noise\n{second}\ntrailing");
        let parsed = parse_framed(&stdout).unwrap().unwrap();
        assert_eq!(parsed.status, OutputStatus::Success);
    }

    #[test]
    fn parse_missing_markers_is_none() {
        assert!(parse_framed("just some logs").is_none());
        assert!(parse_framed(OUTPUT_START_MARKER).is_none());
    }

    #[test]
    fn parse_garbage_between_markers_is_err() {
        let stdout = format!("{OUTPUT_START_MARKER}\nnot json\n{OUTPUT_END_MARKER}");
        assert!(parse_framed(&stdout).unwrap().is_err());
    }
}
