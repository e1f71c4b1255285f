//! Launches one hardened container per agent invocation, feeds it the JSON
//! payload on stdin, and parses the framed reply from stdout.

use super::{sanitize_container_name, ContainerRuntime, ProcessHandle};
use crate::config::Config;
use crate::error::ContainerError;
use crate::ipc::atomic_write_json;
use crate::store::{RegisteredGroup, Store};
use crate::wire::{self, AgentResponse, ContainerInput, InputImage, OutputStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

/// One agent invocation, assembled by the supervisor or scheduler.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub group: RegisteredGroup,
    pub prompt: String,
    pub session_id: Option<String>,
    pub is_scheduled_task: bool,
    pub images: Vec<InputImage>,
}

/// Successful agent run: the parsed response plus any session rotation.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub response: Option<AgentResponse>,
    pub new_session_id: Option<String>,
}

/// Called immediately after the subprocess is live, so the queue can own
/// termination before the run completes.
pub type SpawnCallback = Box<dyn FnOnce(ProcessHandle, String) + Send>;

/// Seam between the supervisor and the sandbox launch mechanics.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        invocation: AgentInvocation,
        on_spawn: SpawnCallback,
    ) -> Result<AgentRunOutcome>;
}

pub struct ContainerRunner {
    runtime: Arc<ContainerRuntime>,
    config: Arc<Config>,
    store: Arc<Store>,
}

impl ContainerRunner {
    pub fn new(runtime: Arc<ContainerRuntime>, config: Arc<Config>, store: Arc<Store>) -> Self {
        Self {
            runtime,
            config,
            store,
        }
    }

    /// Write the `tasks.json` / `groups.json` snapshots the agent reads to
    /// answer `list_tasks` and channel lookups. Non-main groups see only
    /// their own slice.
    fn write_snapshots(&self, group: &RegisteredGroup) -> Result<()> {
        let folder = &group.config.folder;
        let is_main = group.is_main();
        let ipc_dir = self.config.ipc_dir().join(folder);

        let tasks = self
            .store
            .list_tasks(if is_main { None } else { Some(folder) })?;
        let task_views: Vec<serde_json::Value> = tasks
            .iter()
            .map(|task| {
                json!({
                    "id": task.id,
                    "prompt": task.prompt,
                    "scheduleType": task.schedule_kind.as_db(),
                    "scheduleValue": task.schedule_value,
                    "contextMode": task.context_mode.as_db(),
                    "status": task.status.as_db(),
                    "nextRun": task.next_run,
                    "targetChannelId": task.channel_id,
                })
            })
            .collect();
        atomic_write_json(&ipc_dir.join("tasks.json"), &json!(task_views))?;

        let registered = self.store.registered_groups()?;
        let group_views: Vec<serde_json::Value> = if is_main {
            self.store
                .list_chats()?
                .iter()
                .map(|chat| {
                    json!({
                        "channelId": chat.jid,
                        "name": chat.name,
                        "lastActivity": chat.last_message_time,
                        "isRegistered": registered.iter().any(|g| g.channel_id == chat.jid),
                    })
                })
                .collect()
        } else {
            vec![json!({
                "channelId": group.channel_id,
                "name": group.config.name,
                "lastActivity": serde_json::Value::Null,
                "isRegistered": true,
            })]
        };
        atomic_write_json(&ipc_dir.join("groups.json"), &json!(group_views))?;

        Ok(())
    }
}

#[async_trait]
impl AgentRunner for ContainerRunner {
    async fn run(
        &self,
        invocation: AgentInvocation,
        on_spawn: SpawnCallback,
    ) -> Result<AgentRunOutcome> {
        let group = &invocation.group;
        let folder = group.config.folder.clone();
        let is_main = group.is_main();

        let group_dir = self.config.groups_dir().join(&folder);
        let ipc_dir = self.config.ipc_dir().join(&folder);
        std::fs::create_dir_all(&group_dir)
            .with_context(|| format!("Failed to create group dir {}", group_dir.display()))?;
        std::fs::create_dir_all(ipc_dir.join("messages"))?;
        std::fs::create_dir_all(ipc_dir.join("tasks"))?;

        self.write_snapshots(group)?;

        let short_id: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let name = sanitize_container_name(&format!("nanoclaw-{folder}-{short_id}"));

        let env = vec![
            (
                "GEMINI_API_KEY".to_string(),
                self.config.gemini_api_key()?,
            ),
            ("GEMINI_MODEL".to_string(), self.config.gemini.model.clone()),
        ];
        let args = build_run_args(&self.config, group, &name, &env);

        tracing::info!(group = %folder, container = %name, "launching agent container");

        let mut child = Command::new(self.runtime.program())
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn agent container")?;

        let mut stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let stderr = child.stderr.take().context("child stderr unavailable")?;

        let handle = ProcessHandle::new(child);
        on_spawn(handle.clone(), name.clone());

        let input = ContainerInput {
            prompt: invocation.prompt.clone(),
            session_id: invocation.session_id.clone(),
            group_folder: folder.clone(),
            channel_id: group.channel_id.clone(),
            is_main,
            is_scheduled_task: invocation.is_scheduled_task,
            images: invocation.images.clone(),
        };
        let payload = serde_json::to_vec(&input).context("Failed to encode container input")?;
        stdin
            .write_all(&payload)
            .await
            .context("Failed to write container input")?;
        drop(stdin);

        // Agent logs arrive on stderr; stdout is reserved for the framed reply.
        let stderr_group = folder.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(group = %stderr_group, "agent: {line}");
            }
        });

        let mut raw_stdout = String::new();
        BufReader::new(stdout)
            .read_to_string(&mut raw_stdout)
            .await
            .context("Failed to read container stdout")?;

        let status = handle.wait().await?;

        if let Err(error) = self.runtime.remove(&name).await {
            tracing::debug!(container = %name, %error, "post-run container removal failed");
        }

        if !status.success() {
            return Err(ContainerError::Exited {
                status: status.to_string(),
                detail: tail(&raw_stdout, 512),
            }
            .into());
        }

        let output = match wire::parse_framed(&raw_stdout) {
            None => return Err(ContainerError::MissingMarkers.into()),
            Some(Err(error)) => return Err(ContainerError::BadOutput(error.to_string()).into()),
            Some(Ok(output)) => output,
        };

        match output.status {
            OutputStatus::Error => Err(ContainerError::AgentError(
                output.error.unwrap_or_else(|| "unspecified agent error".into()),
            )
            .into()),
            OutputStatus::Success => Ok(AgentRunOutcome {
                response: output.result,
                new_session_id: output.new_session_id,
            }),
        }
    }
}

/// Assemble the hardened `run` argument vector for one invocation.
///
/// Every security flag is present unless the group's registration explicitly
/// opts out; secrets travel only as `-e NAME=VALUE`.
fn build_run_args(
    config: &Config,
    group: &RegisteredGroup,
    name: &str,
    env: &[(String, String)],
) -> Vec<String> {
    let folder = &group.config.folder;
    let overrides = group.config.container.clone().unwrap_or_default();

    let group_dir = config.groups_dir().join(folder);
    let ipc_dir = config.ipc_dir().join(folder);
    let global_dir = config.groups_dir().join("global");

    let mut args: Vec<String> = vec![
        "run".into(),
        "-i".into(),
        "--name".into(),
        name.into(),
        "-v".into(),
        format!("{}:/workspace/group", group_dir.display()),
        "-v".into(),
        format!("{}:/workspace/ipc", ipc_dir.display()),
        "-v".into(),
        format!("{}:/workspace/global", global_dir.display()),
    ];

    if group.is_main() {
        let project_dir = config
            .container
            .project_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        args.push("-v".into());
        args.push(format!("{}:/workspace/project", project_dir.display()));
    }

    if overrides.cap_drop.unwrap_or(true) {
        args.push("--cap-drop=ALL".into());
    }
    if overrides.read_only.unwrap_or(true) {
        args.push("--read-only".into());
    }
    if overrides.tmpfs.unwrap_or(true) {
        args.push("--tmpfs=/tmp".into());
    }
    if overrides.no_new_privileges.unwrap_or(true) {
        args.push("--security-opt=no-new-privileges".into());
    }

    args.push("--memory".into());
    args.push(
        overrides
            .memory
            .unwrap_or_else(|| config.container.memory.clone()),
    );
    args.push("--cpus".into());
    args.push(
        overrides
            .cpus
            .unwrap_or_else(|| config.container.cpus.clone()),
    );

    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(
        overrides
            .image
            .unwrap_or_else(|| config.container.image.clone()),
    );

    args
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
