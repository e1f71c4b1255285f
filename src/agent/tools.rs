//! Tool library available to the sandboxed agent: shell, file operations,
//! search, web access, and the IPC-backed chat/task actions.

use crate::ipc::atomic_write_json;
use crate::llm::ModelClient;
use crate::store::now_timestamp;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Maximum shell command execution time before kill.
const SHELL_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum captured output size in bytes (1 MB).
const MAX_OUTPUT_BYTES: usize = 1_048_576;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FETCH_BYTES: usize = 100_000;
const MAX_SEARCH_MATCHES: usize = 50;

/// Environment variables safe to pass to agent-spawned shells. The injected
/// model credentials (GEMINI_API_KEY, GEMINI_MODEL) are deliberately absent,
/// so the agent cannot exfiltrate them via shell commands.
const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "TERM", "LANG", "LC_ALL", "LC_CTYPE", "USER", "SHELL",
];

/// Per-invocation context for tool execution.
pub struct ToolContext {
    pub group_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub channel_id: String,
    pub is_main: bool,
}

/// Function declarations in Gemini tool format.
pub fn declarations() -> Vec<Value> {
    let decls = json!([
        {
            "name": "bash",
            "description": "Run a shell command in the group workspace",
            "parameters": {
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }
        },
        {
            "name": "read_file",
            "description": "Read a file from the group workspace",
            "parameters": {
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }
        },
        {
            "name": "write_file",
            "description": "Write a file in the group workspace, creating parent directories",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }
        },
        {
            "name": "edit_file",
            "description": "Replace the first occurrence of old_text with new_text in a file",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string" },
                    "new_text": { "type": "string" }
                },
                "required": ["path", "old_text", "new_text"]
            }
        },
        {
            "name": "list_files",
            "description": "List directory entries in the group workspace",
            "parameters": {
                "type": "object",
                "properties": { "path": { "type": "string" } }
            }
        },
        {
            "name": "search_files",
            "description": "Search workspace files for a regex pattern",
            "parameters": {
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" }
                },
                "required": ["pattern"]
            }
        },
        {
            "name": "google_search",
            "description": "Search the web and return a grounded text answer",
            "parameters": {
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }
        },
        {
            "name": "web_fetch",
            "description": "Fetch a URL and return its body as text",
            "parameters": {
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }
        },
        {
            "name": "send_message",
            "description": "Send a chat message outside the current reply (delivered asynchronously)",
            "parameters": {
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "channelId": { "type": "string", "description": "Defaults to the current channel" }
                },
                "required": ["text"]
            }
        },
        {
            "name": "schedule_task",
            "description": "Schedule a future agent run (cron, fixed interval, or one-shot)",
            "parameters": {
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                    "schedule_type": { "type": "string", "enum": ["cron", "interval", "once"] },
                    "schedule_value": { "type": "string" },
                    "context_mode": { "type": "string", "enum": ["group", "isolated"] },
                    "targetChannelId": { "type": "string" }
                },
                "required": ["prompt", "schedule_type", "schedule_value"]
            }
        },
        {
            "name": "list_tasks",
            "description": "List scheduled tasks visible to this group",
            "parameters": { "type": "object", "properties": {} }
        },
        {
            "name": "pause_task",
            "description": "Pause a scheduled task",
            "parameters": {
                "type": "object",
                "properties": { "taskId": { "type": "string" } },
                "required": ["taskId"]
            }
        },
        {
            "name": "resume_task",
            "description": "Resume a paused task",
            "parameters": {
                "type": "object",
                "properties": { "taskId": { "type": "string" } },
                "required": ["taskId"]
            }
        },
        {
            "name": "cancel_task",
            "description": "Cancel a scheduled task",
            "parameters": {
                "type": "object",
                "properties": { "taskId": { "type": "string" } },
                "required": ["taskId"]
            }
        }
    ]);
    vec![json!({ "functionDeclarations": decls })]
}

/// Execute a tool by name; the returned value becomes the functionResponse
/// payload.
pub async fn execute(
    name: &str,
    args: &Value,
    ctx: &ToolContext,
    client: &dyn ModelClient,
) -> Result<Value> {
    match name {
        "bash" => bash(args, ctx).await,
        "read_file" => read_file(args, ctx),
        "write_file" => write_file(args, ctx),
        "edit_file" => edit_file(args, ctx),
        "list_files" => list_files(args, ctx),
        "search_files" => search_files(args, ctx),
        "google_search" => {
            let query = require_str(args, "query")?;
            let answer = client.google_search(query).await?;
            Ok(json!({ "result": answer }))
        }
        "web_fetch" => web_fetch(args).await,
        "send_message" => send_message(args, ctx),
        "schedule_task" => schedule_task(args, ctx),
        "list_tasks" => list_tasks(ctx),
        "pause_task" => task_action(args, ctx, "pause_task"),
        "resume_task" => task_action(args, ctx, "resume_task"),
        "cancel_task" => task_action(args, ctx, "cancel_task"),
        other => anyhow::bail!("unknown tool: {other}"),
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing '{key}' parameter"))
}

/// Resolve a workspace-relative path, refusing absolute paths and traversal.
fn resolve_in(base: &Path, raw: &str) -> Result<PathBuf> {
    let rel = Path::new(raw);
    if rel.is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {raw}");
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path escapes the workspace: {raw}"),
        }
    }
    Ok(base.join(rel))
}

fn truncate_utf8(text: &mut String, max_bytes: usize, marker: &str) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(marker);
}

// ── Shell ────────────────────────────────────────────────────────────────────

async fn bash(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let command = require_str(args, "command")?;

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&ctx.group_dir)
        .env_clear();
    for var in safe_env() {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }

    let result = tokio::time::timeout(SHELL_TIMEOUT, cmd.output()).await;
    match result {
        Ok(Ok(output)) => {
            let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
            truncate_utf8(&mut stdout, MAX_OUTPUT_BYTES, "\n... [output truncated at 1MB]");
            truncate_utf8(&mut stderr, MAX_OUTPUT_BYTES, "\n... [stderr truncated at 1MB]");
            Ok(json!({
                "exitCode": output.status.code(),
                "stdout": stdout,
                "stderr": stderr,
            }))
        }
        Ok(Err(error)) => anyhow::bail!("failed to execute command: {error}"),
        Err(_) => anyhow::bail!(
            "command timed out after {}s and was killed",
            SHELL_TIMEOUT.as_secs()
        ),
    }
}

/// The allowlisted environment for agent-spawned shells.
pub fn safe_env() -> &'static [&'static str] {
    SAFE_ENV_VARS
}

// ── File operations ──────────────────────────────────────────────────────────

fn read_file(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let path = resolve_in(&ctx.group_dir, require_str(args, "path")?)?;
    let mut content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    truncate_utf8(&mut content, MAX_OUTPUT_BYTES, "\n... [truncated at 1MB]");
    Ok(json!({ "content": content }))
}

fn write_file(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let path = resolve_in(&ctx.group_dir, require_str(args, "path")?)?;
    let content = require_str(args, "content")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(json!({ "ok": true, "bytes": content.len() }))
}

fn edit_file(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let path = resolve_in(&ctx.group_dir, require_str(args, "path")?)?;
    let old_text = require_str(args, "old_text")?;
    let new_text = require_str(args, "new_text")?;

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let Some(at) = content.find(old_text) else {
        anyhow::bail!("old_text not found in {}", path.display());
    };
    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..at]);
    updated.push_str(new_text);
    updated.push_str(&content[at + old_text.len()..]);
    std::fs::write(&path, updated)?;
    Ok(json!({ "ok": true }))
}

fn list_files(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let dir = resolve_in(&ctx.group_dir, rel)?;

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let kind = if entry.file_type()?.is_dir() { "dir" } else { "file" };
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "type": kind,
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({ "entries": entries }))
}

fn search_files(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let pattern = require_str(args, "pattern")?;
    let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let root = resolve_in(&ctx.group_dir, rel)?;
    let regex = regex::Regex::new(pattern)
        .with_context(|| format!("invalid pattern: {pattern}"))?;

    let mut matches = Vec::new();
    search_dir(&root, &ctx.group_dir, &regex, &mut matches)?;
    Ok(json!({ "matches": matches, "truncated": matches.len() >= MAX_SEARCH_MATCHES }))
}

fn search_dir(
    dir: &Path,
    base: &Path,
    regex: &regex::Regex,
    matches: &mut Vec<Value>,
) -> Result<()> {
    if matches.len() >= MAX_SEARCH_MATCHES {
        return Ok(());
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.filter_map(std::result::Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            search_dir(&path, base, regex, matches)?;
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            for (line_number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let rel = path.strip_prefix(base).unwrap_or(&path);
                    matches.push(json!({
                        "file": rel.to_string_lossy(),
                        "line": line_number + 1,
                        "text": line,
                    }));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

// ── Web ──────────────────────────────────────────────────────────────────────

async fn web_fetch(args: &Value) -> Result<Value> {
    let url = require_str(args, "url")?;
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetch failed: {url}"))?;
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    truncate_utf8(&mut body, MAX_FETCH_BYTES, "\n... [truncated]");
    Ok(json!({ "status": status, "content": body }))
}

// ── IPC-backed actions ───────────────────────────────────────────────────────

/// Drop an IPC file atomically: write `.json.tmp`, rename to `.json`.
fn drop_ipc_file(dir: &Path, payload: &Value) -> Result<String> {
    let file_name = format!("{}.json", Uuid::new_v4());
    atomic_write_json(&dir.join(&file_name), payload)?;
    Ok(file_name)
}

fn send_message(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let text = require_str(args, "text")?;
    let channel_id = args
        .get("channelId")
        .and_then(Value::as_str)
        .unwrap_or(&ctx.channel_id);

    let payload = json!({
        "type": "message",
        "channelId": channel_id,
        "text": text,
        "timestamp": now_timestamp(),
    });
    drop_ipc_file(&ctx.ipc_dir.join("messages"), &payload)?;
    Ok(json!({ "queued": true }))
}

fn schedule_task(args: &Value, ctx: &ToolContext) -> Result<Value> {
    let prompt = require_str(args, "prompt")?;
    let schedule_type = require_str(args, "schedule_type")?;
    let schedule_value = args
        .get("schedule_value")
        .cloned()
        .context("missing 'schedule_value' parameter")?;
    let target_channel_id = args
        .get("targetChannelId")
        .and_then(Value::as_str)
        .unwrap_or(&ctx.channel_id);
    let context_mode = args
        .get("context_mode")
        .and_then(Value::as_str)
        .unwrap_or("group");

    let payload = json!({
        "type": "schedule_task",
        "prompt": prompt,
        "schedule_type": schedule_type,
        "schedule_value": schedule_value,
        "context_mode": context_mode,
        "targetChannelId": target_channel_id,
        "timestamp": now_timestamp(),
    });
    drop_ipc_file(&ctx.ipc_dir.join("tasks"), &payload)?;
    Ok(json!({ "queued": true }))
}

fn task_action(args: &Value, ctx: &ToolContext, action: &str) -> Result<Value> {
    let task_id = require_str(args, "taskId")?;
    let payload = json!({
        "type": action,
        "taskId": task_id,
        "timestamp": now_timestamp(),
    });
    drop_ipc_file(&ctx.ipc_dir.join("tasks"), &payload)?;
    Ok(json!({ "queued": true }))
}

/// Answered from the host-written snapshot, not the live store.
fn list_tasks(ctx: &ToolContext) -> Result<Value> {
    let snapshot = ctx.ipc_dir.join("tasks.json");
    if !snapshot.exists() {
        return Ok(json!({ "tasks": [] }));
    }
    let raw = std::fs::read_to_string(&snapshot)?;
    let tasks: Value = serde_json::from_str(&raw).context("corrupt tasks snapshot")?;
    Ok(json!({ "tasks": tasks }))
}
