//! Session persistence inside the sandbox: the multi-turn `contents` array is
//! stored verbatim under `.sessions/{id}.json` in the group mount, and every
//! run leaves a dated transcript under `conversations/`.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub fn sessions_dir(group_dir: &Path) -> PathBuf {
    group_dir.join(".sessions")
}

pub fn session_path(group_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir(group_dir).join(format!("{session_id}.json"))
}

/// Load prior history; a missing file yields an empty history rather than an
/// error so a pruned session simply starts over.
pub fn load_contents(group_dir: &Path, session_id: &str) -> Result<Vec<Value>> {
    let path = session_path(group_dir, session_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read session {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Corrupt session file {}", path.display()))
}

/// Persist history atomically so a killed container never leaves a torn file.
pub fn save_contents(group_dir: &Path, session_id: &str, contents: &[Value]) -> Result<()> {
    let path = session_path(group_dir, session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(contents)?)
        .with_context(|| format!("Failed to write session {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Write a human-readable transcript of this run.
pub fn write_transcript(group_dir: &Path, contents: &[Value]) -> Result<PathBuf> {
    let dir = group_dir.join("conversations");
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let path = dir.join(format!("{stamp}.md"));

    let mut body = String::new();
    for turn in contents {
        let role = turn
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        body.push_str(&format!("## {role}\n\n"));

        let parts = turn
            .get("parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                body.push_str(text);
                body.push_str("\n\n");
            } else if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(Value::as_str).unwrap_or("?");
                body.push_str(&format!("*[tool call: {name}]*\n\n"));
            } else if let Some(response) = part.get("functionResponse") {
                let name = response.get("name").and_then(Value::as_str).unwrap_or("?");
                body.push_str(&format!("*[tool result: {name}]*\n\n"));
            }
        }
    }

    std::fs::write(&path, body)
        .with_context(|| format!("Failed to write transcript {}", path.display()))?;
    Ok(path)
}
