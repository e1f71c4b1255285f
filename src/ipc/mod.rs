//! File-based IPC from sandboxed agents back to the host. Each group owns an
//! isolated drop-directory tree; the directory path is the authoritative
//! source identity and payload-claimed identity is never trusted. Poison
//! files (parse failures, unauthorized actions) are quarantined, never
//! retried.

use crate::channels::Channel;
use crate::config::{Config, MAIN_GROUP_FOLDER};
use crate::error::IpcError;
use crate::store::{
    now_timestamp, ContainerOverrides, ContextMode, GroupConfig, RegisteredGroup, ScheduleKind,
    Store,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Write JSON atomically: `.tmp` then rename, so readers never observe a
/// partial file.
pub fn atomic_write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, body)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// Tagged IPC payload. Unknown `type` values fail decoding and land in the
/// poison directory.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IpcPayload {
    #[serde(rename = "message")]
    Message {
        #[serde(rename = "channelId")]
        channel_id: String,
        text: String,
    },
    #[serde(rename = "schedule_task")]
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: serde_json::Value,
        #[serde(default)]
        context_mode: Option<String>,
        #[serde(rename = "targetChannelId")]
        target_channel_id: String,
    },
    #[serde(rename = "pause_task")]
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "resume_task")]
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "cancel_task")]
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "refresh_groups")]
    RefreshGroups {},
    #[serde(rename = "register_channel")]
    RegisterChannel {
        #[serde(rename = "channelId")]
        channel_id: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default, rename = "containerConfig")]
        container_config: Option<ContainerOverrides>,
    },
}

// ── Watcher ──────────────────────────────────────────────────────────────────

/// Which drop directory a file came from; payloads must match it.
#[derive(Debug, Clone, Copy)]
enum DropKind {
    Messages,
    Tasks,
}

pub struct IpcWatcher {
    config: Arc<Config>,
    store: Arc<Store>,
    channel: Arc<dyn Channel>,
    /// Invoked after the registered-group set changes, so the supervisor can
    /// refresh its mirror without the watcher owning it.
    on_groups_changed: Arc<dyn Fn() + Send + Sync>,
}

impl IpcWatcher {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        channel: Arc<dyn Channel>,
        on_groups_changed: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            on_groups_changed,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.intervals.ipc_poll_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = self.scan_once().await {
                tracing::warn!(%error, "ipc scan failed");
            }
        }
    }

    /// One sweep over every group's drop directories.
    pub async fn scan_once(&self) -> Result<()> {
        let root = self.config.ipc_dir();
        if !root.is_dir() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let source_folder = entry.file_name().to_string_lossy().to_string();
            if source_folder == "errors" {
                continue;
            }

            self.process_drop_dir(
                &source_folder,
                &entry.path().join("messages"),
                DropKind::Messages,
            )
            .await;
            self.process_drop_dir(&source_folder, &entry.path().join("tasks"), DropKind::Tasks)
                .await;
        }
        Ok(())
    }

    async fn process_drop_dir(&self, source_folder: &str, dir: &Path, kind: DropKind) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            // Writers rename `.json.tmp` into `.json`; only finished files count.
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            match self.consume_file(source_folder, &path, kind).await {
                Ok(()) => {
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::warn!(file = %path.display(), %error, "failed to unlink ipc file");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        source = %source_folder,
                        file = %path.display(),
                        %error,
                        "quarantining poison ipc file"
                    );
                    self.quarantine(source_folder, &path);
                }
            }
        }
    }

    async fn consume_file(&self, source_folder: &str, path: &Path, kind: DropKind) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let payload: IpcPayload = serde_json::from_str(&raw)
            .map_err(|error| IpcError::InvalidPayload(error.to_string()))?;

        let is_message = matches!(payload, IpcPayload::Message { .. });
        let kind_ok = match kind {
            DropKind::Messages => is_message,
            DropKind::Tasks => !is_message,
        };
        if !kind_ok {
            return Err(IpcError::InvalidPayload(format!(
                "payload type does not belong in {}/",
                match kind {
                    DropKind::Messages => "messages",
                    DropKind::Tasks => "tasks",
                }
            ))
            .into());
        }

        let is_main = source_folder == MAIN_GROUP_FOLDER;
        self.dispatch(source_folder, is_main, payload).await
    }

    fn quarantine(&self, source_folder: &str, path: &Path) {
        let errors_dir = self.config.ipc_dir().join("errors");
        if let Err(error) = std::fs::create_dir_all(&errors_dir) {
            tracing::error!(%error, "failed to create ipc errors dir");
            return;
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown.json".into());
        let target = errors_dir.join(format!("{source_folder}-{file_name}"));
        if let Err(error) = std::fs::rename(path, &target) {
            tracing::error!(file = %path.display(), %error, "failed to quarantine ipc file");
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    async fn dispatch(&self, source: &str, is_main: bool, payload: IpcPayload) -> Result<()> {
        match payload {
            IpcPayload::Message { channel_id, text } => {
                self.deliver_message(source, is_main, &channel_id, &text).await
            }
            IpcPayload::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_channel_id,
            } => self.schedule_task(
                source,
                is_main,
                &prompt,
                &schedule_type,
                &schedule_value,
                context_mode.as_deref(),
                &target_channel_id,
            ),
            IpcPayload::PauseTask { task_id } => {
                let task = self.authorized_task(source, is_main, &task_id)?;
                self.store
                    .set_task_status(&task.id, crate::store::TaskStatus::Paused)?;
                tracing::info!(task = %task.id, "task paused via ipc");
                Ok(())
            }
            IpcPayload::ResumeTask { task_id } => {
                let task = self.authorized_task(source, is_main, &task_id)?;
                self.store
                    .set_task_status(&task.id, crate::store::TaskStatus::Active)?;
                tracing::info!(task = %task.id, "task resumed via ipc");
                Ok(())
            }
            IpcPayload::CancelTask { task_id } => {
                let task = self.authorized_task(source, is_main, &task_id)?;
                self.store.delete_task(&task.id)?;
                tracing::info!(task = %task.id, "task cancelled via ipc");
                Ok(())
            }
            IpcPayload::RefreshGroups {} => {
                require_main(source, is_main, "refresh_groups")?;
                (self.on_groups_changed)();
                Ok(())
            }
            IpcPayload::RegisterChannel {
                channel_id,
                name,
                folder,
                trigger,
                container_config,
            } => {
                require_main(source, is_main, "register_channel")?;
                self.register_channel(&channel_id, &name, &folder, trigger, container_config)
            }
        }
    }

    async fn deliver_message(
        &self,
        source: &str,
        is_main: bool,
        channel_id: &str,
        text: &str,
    ) -> Result<()> {
        if channel_id.is_empty() || text.is_empty() {
            return Err(IpcError::InvalidPayload("empty channelId or text".into()).into());
        }

        if !is_main {
            let target_folder = self
                .store
                .get_group(channel_id)?
                .map(|group| group.config.folder);
            if target_folder.as_deref() != Some(source) {
                return Err(IpcError::Unauthorized {
                    source_group: source.to_string(),
                    target: channel_id.to_string(),
                }
                .into());
            }
        }

        for chunk in
            crate::channels::chunker::chunk_message(text, self.channel.max_message_length())
        {
            self.channel.send(channel_id, &chunk).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_task(
        &self,
        source: &str,
        is_main: bool,
        prompt: &str,
        schedule_type: &str,
        schedule_value: &serde_json::Value,
        context_mode: Option<&str>,
        target_channel_id: &str,
    ) -> Result<()> {
        let kind = ScheduleKind::parse(schedule_type).ok_or_else(|| {
            IpcError::InvalidPayload(format!("unknown schedule_type: {schedule_type}"))
        })?;
        let value = match schedule_value {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Number(number) => number.to_string(),
            other => {
                return Err(IpcError::InvalidPayload(format!(
                    "schedule_value must be a string or number, got {other}"
                ))
                .into())
            }
        };
        let mode = match context_mode {
            None => ContextMode::Group,
            Some(raw) => ContextMode::parse(raw).ok_or_else(|| {
                IpcError::InvalidPayload(format!("unknown context_mode: {raw}"))
            })?,
        };

        let target_group = self
            .store
            .get_group(target_channel_id)?
            .ok_or_else(|| {
                IpcError::InvalidPayload(format!("unknown target channel: {target_channel_id}"))
            })?;
        if !is_main && target_group.config.folder != source {
            return Err(IpcError::Unauthorized {
                source_group: source.to_string(),
                target: target_group.config.folder,
            }
            .into());
        }

        let next_run = crate::scheduler::compute_initial_next_run(
            kind,
            &value,
            chrono::Utc::now(),
            self.config.tz(),
        )?;

        let task = self.store.create_task(
            &target_group.config.folder,
            target_channel_id,
            prompt,
            kind,
            &value,
            mode,
            &crate::store::format_timestamp(next_run),
        )?;
        tracing::info!(task = %task.id, group = %task.group_folder, "task scheduled via ipc");
        Ok(())
    }

    /// Fetch a task, enforcing that non-main sources only touch their own.
    fn authorized_task(
        &self,
        source: &str,
        is_main: bool,
        task_id: &str,
    ) -> Result<crate::store::Task> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| IpcError::InvalidPayload(format!("unknown task: {task_id}")))?;
        if !is_main && task.group_folder != source {
            return Err(IpcError::Unauthorized {
                source_group: source.to_string(),
                target: task.group_folder,
            }
            .into());
        }
        Ok(task)
    }

    fn register_channel(
        &self,
        channel_id: &str,
        name: &str,
        folder: &str,
        trigger: Option<String>,
        container_config: Option<ContainerOverrides>,
    ) -> Result<()> {
        if channel_id.is_empty() || folder.is_empty() {
            return Err(IpcError::InvalidPayload("empty channelId or folder".into()).into());
        }

        self.store.register_group(&RegisteredGroup {
            channel_id: channel_id.to_string(),
            config: GroupConfig {
                name: name.to_string(),
                folder: folder.to_string(),
                trigger,
                requires_trigger: true,
                added_at: now_timestamp(),
                container: container_config,
            },
        })?;
        (self.on_groups_changed)();
        tracing::info!(channel = %channel_id, folder = %folder, "channel registered via ipc");
        Ok(())
    }
}

fn require_main(source: &str, is_main: bool, action: &str) -> Result<()> {
    if is_main {
        Ok(())
    } else {
        Err(IpcError::Unauthorized {
            source_group: source.to_string(),
            target: action.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, channel_id: &str, message: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), message.to_string()));
            Ok(())
        }

        async fn listen(
            &self,
            _tx: tokio::sync::mpsc::Sender<ChannelEvent>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        config: Arc<Config>,
        store: Arc<Store>,
        channel: Arc<RecordingChannel>,
        watcher: IpcWatcher,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config {
            data_dir: tmp.path().to_path_buf(),
            ..Config::default()
        });
        let store = Arc::new(Store::open(&config.db_path()).unwrap());
        let channel = RecordingChannel::new();
        let watcher = IpcWatcher::new(
            Arc::clone(&config),
            Arc::clone(&store),
            channel.clone(),
            Arc::new(|| {}),
        );

        for (channel_id, folder) in [("CMAIN", MAIN_GROUP_FOLDER), ("C1", "g1"), ("C2", "g2")] {
            store
                .register_group(&RegisteredGroup {
                    channel_id: channel_id.to_string(),
                    config: GroupConfig {
                        name: folder.to_string(),
                        folder: folder.to_string(),
                        trigger: None,
                        requires_trigger: true,
                        added_at: now_timestamp(),
                        container: None,
                    },
                })
                .unwrap();
        }

        Fixture {
            _tmp: tmp,
            config,
            store,
            channel,
            watcher,
        }
    }

    fn drop_file(config: &Config, folder: &str, kind: &str, name: &str, body: &str) -> PathBuf {
        let dir = config.ipc_dir().join(folder).join(kind);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn message_from_own_group_is_delivered_and_unlinked() {
        let fx = fixture();
        let path = drop_file(
            &fx.config,
            "g1",
            "messages",
            "m1.json",
            r#"{"type":"message","channelId":"C1","text":"hello"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        assert_eq!(fx.channel.sent(), vec![("C1".to_string(), "hello".to_string())]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cross_group_message_is_quarantined() {
        let fx = fixture();
        let path = drop_file(
            &fx.config,
            "g2",
            "messages",
            "m1.json",
            r#"{"type":"message","channelId":"C1","text":"sneaky"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        assert!(fx.channel.sent().is_empty());
        assert!(!path.exists());
        assert!(fx.config.ipc_dir().join("errors/g2-m1.json").exists());
    }

    #[tokio::test]
    async fn main_may_message_any_channel() {
        let fx = fixture();
        drop_file(
            &fx.config,
            MAIN_GROUP_FOLDER,
            "messages",
            "m1.json",
            r#"{"type":"message","channelId":"C2","text":"broadcast"}"#,
        );

        fx.watcher.scan_once().await.unwrap();
        assert_eq!(
            fx.channel.sent(),
            vec![("C2".to_string(), "broadcast".to_string())]
        );
    }

    #[tokio::test]
    async fn unparseable_payload_is_quarantined() {
        let fx = fixture();
        drop_file(&fx.config, "g1", "tasks", "bad.json", "{not json");
        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "unknown.json",
            r#"{"type":"explode_everything"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        assert!(fx.config.ipc_dir().join("errors/g1-bad.json").exists());
        assert!(fx.config.ipc_dir().join("errors/g1-unknown.json").exists());
    }

    #[tokio::test]
    async fn payload_in_wrong_drop_dir_is_quarantined() {
        let fx = fixture();
        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "m1.json",
            r#"{"type":"message","channelId":"C1","text":"wrong drawer"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        assert!(fx.channel.sent().is_empty());
        assert!(fx.config.ipc_dir().join("errors/g1-m1.json").exists());
    }

    #[tokio::test]
    async fn tmp_files_are_ignored() {
        let fx = fixture();
        let dir = fx.config.ipc_dir().join("g1/messages");
        std::fs::create_dir_all(&dir).unwrap();
        let tmp_path = dir.join("m1.json.tmp");
        std::fs::write(&tmp_path, "partial write").unwrap();

        fx.watcher.scan_once().await.unwrap();

        assert!(tmp_path.exists(), "in-progress writes must not be consumed");
        assert!(fx.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn schedule_task_validates_and_creates() {
        let fx = fixture();
        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "t1.json",
            r#"{"type":"schedule_task","prompt":"check news","schedule_type":"interval","schedule_value":60000,"context_mode":"isolated","targetChannelId":"C1"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        let tasks = fx.store.list_tasks(Some("g1")).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].schedule_kind, ScheduleKind::Interval);
        assert_eq!(tasks[0].schedule_value, "60000");
        assert_eq!(tasks[0].context_mode, ContextMode::Isolated);
        assert!(tasks[0].next_run.is_some());
    }

    #[tokio::test]
    async fn schedule_task_with_invalid_cron_is_quarantined() {
        let fx = fixture();
        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "t1.json",
            r#"{"type":"schedule_task","prompt":"x","schedule_type":"cron","schedule_value":"not valid","targetChannelId":"C1"}"#,
        );

        fx.watcher.scan_once().await.unwrap();

        assert!(fx.store.list_tasks(None).unwrap().is_empty());
        assert!(fx.config.ipc_dir().join("errors/g1-t1.json").exists());
    }

    #[tokio::test]
    async fn cancel_task_refused_across_groups() {
        let fx = fixture();
        let task = fx
            .store
            .create_task(
                "g1",
                "C1",
                "keep me",
                ScheduleKind::Interval,
                "60000",
                ContextMode::Group,
                "2026-01-01T00:00:00.000Z",
            )
            .unwrap();

        drop_file(
            &fx.config,
            "g2",
            "tasks",
            "abc.json",
            &format!(r#"{{"type":"cancel_task","taskId":"{}"}}"#, task.id),
        );

        fx.watcher.scan_once().await.unwrap();

        assert!(fx.store.get_task(&task.id).unwrap().is_some(), "task survives");
        assert!(fx.config.ipc_dir().join("errors/g2-abc.json").exists());
    }

    #[tokio::test]
    async fn pause_and_resume_within_own_group() {
        let fx = fixture();
        let task = fx
            .store
            .create_task(
                "g1",
                "C1",
                "toggle",
                ScheduleKind::Cron,
                "*/5 * * * *",
                ContextMode::Group,
                "2026-01-01T00:00:00.000Z",
            )
            .unwrap();

        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "p.json",
            &format!(r#"{{"type":"pause_task","taskId":"{}"}}"#, task.id),
        );
        fx.watcher.scan_once().await.unwrap();
        assert_eq!(
            fx.store.get_task(&task.id).unwrap().unwrap().status,
            crate::store::TaskStatus::Paused
        );

        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "r.json",
            &format!(r#"{{"type":"resume_task","taskId":"{}"}}"#, task.id),
        );
        fx.watcher.scan_once().await.unwrap();
        assert_eq!(
            fx.store.get_task(&task.id).unwrap().unwrap().status,
            crate::store::TaskStatus::Active
        );
    }

    #[tokio::test]
    async fn register_channel_requires_main() {
        let fx = fixture();
        drop_file(
            &fx.config,
            "g1",
            "tasks",
            "reg.json",
            r#"{"type":"register_channel","channelId":"C9","name":"New","folder":"g9"}"#,
        );
        fx.watcher.scan_once().await.unwrap();
        assert!(fx.store.get_group("C9").unwrap().is_none());
        assert!(fx.config.ipc_dir().join("errors/g1-reg.json").exists());

        drop_file(
            &fx.config,
            MAIN_GROUP_FOLDER,
            "tasks",
            "reg.json",
            r#"{"type":"register_channel","channelId":"C9","name":"New","folder":"g9","trigger":"robo"}"#,
        );
        fx.watcher.scan_once().await.unwrap();
        let group = fx.store.get_group("C9").unwrap().unwrap();
        assert_eq!(group.config.folder, "g9");
        assert_eq!(group.config.trigger.as_deref(), Some("robo"));
        assert!(group.config.requires_trigger);
    }

    #[test]
    fn atomic_write_lands_without_tmp_residue() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/out.json");
        atomic_write_json(&path, &serde_json::json!({"ok": true})).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["ok"], true);
    }
}
