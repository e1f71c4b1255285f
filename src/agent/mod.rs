//! The function-calling loop that runs inside the sandboxed subprocess. Reads
//! one [`ContainerInput`], replays the group's session history, iterates model
//! turns executing requested tools, and emits a framed [`ContainerOutput`].

pub mod session;
pub mod tools;

use crate::llm::ModelClient;
use crate::wire::{AgentResponse, ContainerInput, ContainerOutput, OutputType};
use anyhow::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use uuid::Uuid;

/// Upper bound on model round-trips per invocation.
pub const MAX_TURNS: usize = 30;

const SILENT_MARKER: &str = "[SILENT]";

const BASE_SYSTEM_PROMPT: &str = "\
You are an assistant embedded in a chat channel. The user turn contains the \
recent chat messages as an XML block; read them all and respond to what is \
actually being asked. Reply in plain text suitable for chat. If nothing in \
the batch needs a reply, respond with exactly [SILENT]. Use the provided \
tools for any real-world action instead of describing what you would do.";

/// Mount layout inside the sandbox.
pub struct AgentEnv {
    pub group_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub global_dir: PathBuf,
}

impl Default for AgentEnv {
    fn default() -> Self {
        Self {
            group_dir: PathBuf::from("/workspace/group"),
            ipc_dir: PathBuf::from("/workspace/ipc"),
            global_dir: PathBuf::from("/workspace/global"),
        }
    }
}

/// Run one agent invocation end to end; never panics outward, always yields a
/// well-formed output for the host to frame.
pub async fn run(env: &AgentEnv, client: &dyn ModelClient, input: ContainerInput) -> ContainerOutput {
    match run_inner(env, client, &input).await {
        Ok((response, session_id)) => ContainerOutput::success(response, Some(session_id)),
        Err(error) => ContainerOutput::failure(error.to_string()),
    }
}

async fn run_inner(
    env: &AgentEnv,
    client: &dyn ModelClient,
    input: &ContainerInput,
) -> Result<(AgentResponse, String)> {
    let session_id = input
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut contents = match &input.session_id {
        Some(id) => session::load_contents(&env.group_dir, id)?,
        None => Vec::new(),
    };

    let system = build_system_prompt(env, input.is_main);

    let mut user_parts = vec![json!({ "text": input.prompt })];
    for image in &input.images {
        user_parts.push(json!({
            "inlineData": { "mimeType": image.mime_type, "data": image.data },
        }));
    }
    contents.push(json!({ "role": "user", "parts": user_parts }));

    let ctx = tools::ToolContext {
        group_dir: env.group_dir.clone(),
        ipc_dir: env.ipc_dir.clone(),
        channel_id: input.channel_id.clone(),
        is_main: input.is_main,
    };
    let declarations = tools::declarations();

    let mut final_text = String::new();
    for turn in 0..MAX_TURNS {
        let parts = client
            .generate(Some(system.as_str()), &contents, &declarations)
            .await?;
        let calls = extract_function_calls(&parts);
        // Model parts are appended verbatim so opaque provider fields
        // (thoughtSignature and friends) survive the round trip.
        contents.push(json!({ "role": "model", "parts": parts }));

        if calls.is_empty() {
            final_text = strip_silent(&collect_text(&contents));
            break;
        }

        tracing::debug!(turn, count = calls.len(), "executing tool calls");
        let mut responses = Vec::with_capacity(calls.len());
        for (name, args) in calls {
            let payload = match tools::execute(&name, &args, &ctx, client).await {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(tool = %name, %error, "tool execution failed");
                    json!({ "error": error.to_string() })
                }
            };
            responses.push(json!({
                "functionResponse": { "name": name, "response": payload },
            }));
        }
        contents.push(json!({ "role": "user", "parts": responses }));
    }

    session::save_contents(&env.group_dir, &session_id, &contents)?;
    if let Err(error) = session::write_transcript(&env.group_dir, &contents) {
        tracing::warn!(%error, "failed to write transcript");
    }

    let response = if final_text.trim().is_empty() {
        AgentResponse {
            output_type: OutputType::Log,
            user_message: None,
            internal_log: Some("agent finished without a user-facing reply".into()),
        }
    } else {
        AgentResponse {
            output_type: OutputType::Message,
            user_message: Some(final_text),
            internal_log: None,
        }
    };
    Ok((response, session_id))
}

/// System prompt: the built-in preamble plus the group's `GEMINI.md` and, for
/// non-main groups, the shared global `GEMINI.md`.
fn build_system_prompt(env: &AgentEnv, is_main: bool) -> String {
    let mut sections = vec![BASE_SYSTEM_PROMPT.to_string()];
    if let Ok(group) = std::fs::read_to_string(env.group_dir.join("GEMINI.md")) {
        sections.push(group);
    }
    if !is_main {
        if let Ok(global) = std::fs::read_to_string(env.global_dir.join("GEMINI.md")) {
            sections.push(global);
        }
    }
    sections.join("\n\n")
}

fn extract_function_calls(parts: &[Value]) -> Vec<(String, Value)> {
    parts
        .iter()
        .filter_map(|part| part.get("functionCall"))
        .map(|call| {
            (
                call.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                call.get("args").cloned().unwrap_or_else(|| json!({})),
            )
        })
        .collect()
}

/// Concatenated text of the last model turn.
fn collect_text(contents: &[Value]) -> String {
    let Some(last) = contents.last() else {
        return String::new();
    };
    last.get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn strip_silent(text: &str) -> String {
    text.replace(SILENT_MARKER, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays a script of canned model responses.
    struct ScriptedModel {
        responses: Mutex<VecDeque<Vec<Value>>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Vec<Value>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate(
            &self,
            _system: Option<&str>,
            _contents: &[Value],
            _tools: &[Value],
        ) -> Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            match responses.pop_front() {
                Some(parts) => Ok(parts),
                // Keep requesting a tool forever once the script runs out.
                None => Ok(vec![json!({
                    "functionCall": { "name": "list_files", "args": {} },
                })]),
            }
        }

        async fn google_search(&self, _query: &str) -> Result<String> {
            Ok("no results".into())
        }
    }

    fn env(tmp: &TempDir) -> AgentEnv {
        let env = AgentEnv {
            group_dir: tmp.path().join("group"),
            ipc_dir: tmp.path().join("ipc"),
            global_dir: tmp.path().join("global"),
        };
        std::fs::create_dir_all(&env.group_dir).unwrap();
        std::fs::create_dir_all(env.ipc_dir.join("messages")).unwrap();
        std::fs::create_dir_all(env.ipc_dir.join("tasks")).unwrap();
        env
    }

    fn input(session_id: Option<&str>) -> ContainerInput {
        ContainerInput {
            prompt: "<messages>\n<message sender=\"u1\" time=\"1\">hello</message>\n</messages>"
                .into(),
            session_id: session_id.map(String::from),
            group_folder: "g1".into(),
            channel_id: "C1".into(),
            is_main: false,
            is_scheduled_task: false,
            images: Vec::new(),
        }
    }

    #[tokio::test]
    async fn plain_text_reply_becomes_message_output() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        let model = ScriptedModel::new(vec![vec![json!({ "text": "hi there" })]]);

        let output = run(&env, &model, input(None)).await;

        assert_eq!(output.status, crate::wire::OutputStatus::Success);
        let response = output.result.unwrap();
        assert_eq!(response.output_type, OutputType::Message);
        assert_eq!(response.user_message.as_deref(), Some("hi there"));
        let session_id = output.new_session_id.unwrap();
        assert!(!session_id.is_empty());

        // The session was persisted with both turns.
        let contents = session::load_contents(&env.group_dir, &session_id).unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[tokio::test]
    async fn silent_marker_yields_log_output() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        let model = ScriptedModel::new(vec![vec![json!({ "text": "[SILENT]" })]]);

        let output = run(&env, &model, input(None)).await;
        let response = output.result.unwrap();
        assert_eq!(response.output_type, OutputType::Log);
        assert!(response.user_message.is_none());
    }

    #[tokio::test]
    async fn tool_call_round_trip_then_reply() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        std::fs::write(env.group_dir.join("hello.txt"), "content").unwrap();
        let model = ScriptedModel::new(vec![
            vec![json!({
                "functionCall": { "name": "list_files", "args": {} },
                "thoughtSignature": "opaque-sig",
            })],
            vec![json!({ "text": "you have hello.txt" })],
        ]);

        let output = run(&env, &model, input(None)).await;

        assert_eq!(model.call_count(), 2);
        let response = output.result.unwrap();
        assert_eq!(response.user_message.as_deref(), Some("you have hello.txt"));

        let session_id = output.new_session_id.unwrap();
        let contents = session::load_contents(&env.group_dir, &session_id).unwrap();
        // user, model(call), user(functionResponse), model(text)
        assert_eq!(contents.len(), 4);
        assert_eq!(
            contents[1]["parts"][0]["thoughtSignature"], "opaque-sig",
            "model parts must be stored verbatim"
        );
        assert!(contents[2]["parts"][0]["functionResponse"]["name"] == "list_files");
    }

    #[tokio::test]
    async fn turn_limit_bounds_a_tool_loop() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        // Empty script: the stub requests a tool call on every turn.
        let model = ScriptedModel::new(Vec::new());

        let output = run(&env, &model, input(None)).await;

        assert_eq!(model.call_count(), MAX_TURNS);
        let response = output.result.unwrap();
        assert_eq!(response.output_type, OutputType::Log);
    }

    #[tokio::test]
    async fn resumed_session_keeps_prior_history() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        let prior = vec![
            json!({ "role": "user", "parts": [{ "text": "earlier question" }] }),
            json!({
                "role": "model",
                "parts": [{ "text": "earlier answer", "thoughtSignature": "keep-me" }],
            }),
        ];
        session::save_contents(&env.group_dir, "s1", &prior).unwrap();

        let model = ScriptedModel::new(vec![vec![json!({ "text": "continuing" })]]);
        let output = run(&env, &model, input(Some("s1"))).await;

        assert_eq!(output.new_session_id.as_deref(), Some("s1"));
        let contents = session::load_contents(&env.group_dir, "s1").unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[1]["parts"][0]["thoughtSignature"], "keep-me");
    }

    #[test]
    fn strip_silent_removes_stray_markers() {
        assert_eq!(strip_silent("[SILENT]"), "");
        assert_eq!(strip_silent("hello [SILENT] world"), "hello  world");
        assert_eq!(strip_silent("  plain  "), "plain");
    }

    #[test]
    fn system_prompt_includes_group_and_global_guides() {
        let tmp = TempDir::new().unwrap();
        let env = env(&tmp);
        std::fs::create_dir_all(&env.global_dir).unwrap();
        std::fs::write(env.group_dir.join("GEMINI.md"), "group notes").unwrap();
        std::fs::write(env.global_dir.join("GEMINI.md"), "global notes").unwrap();

        let non_main = build_system_prompt(&env, false);
        assert!(non_main.contains("group notes"));
        assert!(non_main.contains("global notes"));

        let main = build_system_prompt(&env, true);
        assert!(main.contains("group notes"));
        assert!(!main.contains("global notes"));
    }
}
