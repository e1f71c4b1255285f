//! Supervisor: durable message intake, the dispatch poll loop, the
//! per-channel processor injected into the queue, startup recovery, and
//! scheduled-task execution.

pub mod prompt;

use crate::channels::{Channel, ChannelEvent};
use crate::config::Config;
use crate::container::runner::{AgentInvocation, AgentRunOutcome, AgentRunner, SpawnCallback};
use crate::queue::GroupQueue;
use crate::store::{
    build_message_content, format_timestamp, now_timestamp, RegisteredGroup, Store, Task,
};
use crate::wire::OutputType;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Prefix telling the agent a prompt came from the scheduler, not a user.
pub const SCHEDULED_TASK_BANNER: &str =
    "[Scheduled task] This prompt was triggered by a schedule, not sent by a user:\n\n";

const TYPING_REFRESH: Duration = Duration::from_secs(9);

pub struct Supervisor {
    config: Arc<Config>,
    store: Arc<Store>,
    queue: Arc<GroupQueue>,
    channel: Arc<dyn Channel>,
    runner: Arc<dyn AgentRunner>,
    /// Mirror of `registered_groups`; refreshed whenever the store changes.
    groups: RwLock<HashMap<String, RegisteredGroup>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        queue: Arc<GroupQueue>,
        channel: Arc<dyn Channel>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Arc<Self>> {
        let supervisor = Arc::new(Self {
            config,
            store,
            queue,
            channel,
            runner,
            groups: RwLock::new(HashMap::new()),
        });
        supervisor.refresh_groups()?;

        // Constructor injection resolves the queue ↔ supervisor cycle.
        let processor_supervisor = Arc::clone(&supervisor);
        supervisor.queue.set_message_processor(Arc::new(
            move |channel_id: String| -> Pin<Box<dyn Future<Output = bool> + Send>> {
                let supervisor = Arc::clone(&processor_supervisor);
                Box::pin(async move { supervisor.process_channel(&channel_id).await })
            },
        ));

        Ok(supervisor)
    }

    /// Reload the registered-groups mirror from the store.
    pub fn refresh_groups(&self) -> Result<()> {
        let groups = self.store.registered_groups()?;
        let mut mirror = self.groups.write().expect("groups lock poisoned");
        mirror.clear();
        for group in groups {
            mirror.insert(group.channel_id.clone(), group);
        }
        Ok(())
    }

    pub fn group_for(&self, channel_id: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .expect("groups lock poisoned")
            .get(channel_id)
            .cloned()
    }

    pub fn group_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .expect("groups lock poisoned")
            .values()
            .find(|group| group.config.folder == folder)
            .cloned()
    }

    // ── Intake ───────────────────────────────────────────────────────────────

    /// Durable ingestion of one inbound chat event. Chat metadata is stored
    /// unconditionally; message rows only for registered channels.
    pub fn ingest(&self, event: &ChannelEvent) -> Result<()> {
        let timestamp = normalize_timestamp(&event.timestamp);
        self.store
            .upsert_chat(&event.channel_id, &event.channel_name, &timestamp)?;

        if self.group_for(&event.channel_id).is_none() {
            return Ok(());
        }

        let mentions_bot = event.mentioned || event.reply_to_bot;
        let content = build_message_content(&event.content, &event.attachments);
        self.store.append_message(
            &event.channel_id,
            &event.sender,
            &content,
            &timestamp,
            mentions_bot,
        )?;
        Ok(())
    }

    /// Pump inbound events from the platform client into intake.
    pub async fn run_intake(
        &self,
        mut rx: tokio::sync::mpsc::Receiver<ChannelEvent>,
        shutdown: Arc<AtomicBool>,
    ) {
        while let Some(event) = rx.recv().await {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = self.ingest(&event) {
                tracing::warn!(channel = %event.channel_id, %error, "intake failed");
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Poll for undispatched messages. The global cursor advances and is
    /// persisted before any enqueue, so a crash mid-dispatch re-enqueues via
    /// recovery instead of skipping.
    pub async fn run_poll_loop(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.intervals.poll_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = self.poll_once() {
                tracing::warn!(%error, "dispatch poll failed");
            }
        }
    }

    fn poll_once(&self) -> Result<()> {
        let last = self.store.last_timestamp()?;
        let batch = self
            .store
            .channels_with_messages_since(last.as_deref(), &self.config.assistant_name)?;
        if batch.is_empty() {
            return Ok(());
        }

        let max_timestamp = batch
            .iter()
            .map(|(_, timestamp)| timestamp.as_str())
            .max()
            .expect("non-empty batch")
            .to_string();
        self.store.set_last_timestamp(&max_timestamp)?;

        for (channel_id, _) in batch {
            self.queue.enqueue_message_check(&channel_id);
        }
        Ok(())
    }

    /// Re-enqueue unfinished work on boot: anything past the per-channel agent
    /// watermark is still pending regardless of the global cursor.
    pub fn startup_recovery(&self) -> Result<()> {
        let groups: Vec<RegisteredGroup> = {
            let mirror = self.groups.read().expect("groups lock poisoned");
            mirror.values().cloned().collect()
        };

        for group in groups {
            let watermark = self.store.last_agent_timestamp(&group.channel_id)?;
            let pending = self.store.messages_since(
                &group.channel_id,
                watermark.as_deref(),
                &self.config.assistant_name,
            )?;
            if !pending.is_empty() {
                tracing::info!(
                    channel = %group.channel_id,
                    count = pending.len(),
                    "recovering unfinished messages"
                );
                self.queue.enqueue_message_check(&group.channel_id);
            }
        }
        Ok(())
    }

    // ── Per-channel processor ────────────────────────────────────────────────

    /// Drain the channel's backlog into one agent turn. Returns success;
    /// failure makes the queue retry with backoff and leaves the agent
    /// watermark untouched.
    pub async fn process_channel(&self, channel_id: &str) -> bool {
        match self.process_channel_inner(channel_id).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(channel = %channel_id, %error, "agent turn failed");
                false
            }
        }
    }

    async fn process_channel_inner(&self, channel_id: &str) -> Result<()> {
        let Some(group) = self.group_for(channel_id) else {
            return Ok(());
        };

        let watermark = self.store.last_agent_timestamp(channel_id)?;
        let messages = self.store.messages_since(
            channel_id,
            watermark.as_deref(),
            &self.config.assistant_name,
        )?;
        if messages.is_empty() {
            return Ok(());
        }

        if !prompt::trigger_matches(&group, &self.config.assistant_name, &messages) {
            tracing::debug!(channel = %channel_id, "no trigger in batch, skipping agent run");
            return Ok(());
        }

        let batch_end = messages
            .last()
            .expect("non-empty batch")
            .timestamp
            .clone();
        let prompt_block = prompt::format_messages_block(&messages);
        let session_id = self.store.get_session(&group.config.folder)?;

        let invocation = AgentInvocation {
            group: group.clone(),
            prompt: prompt_block,
            session_id,
            is_scheduled_task: false,
            images: Vec::new(),
        };

        let outcome = self.invoke_agent(invocation).await?;

        // Advance and persist the watermark first; delivery failures must not
        // cause the batch to be re-consumed.
        self.store.set_last_agent_timestamp(channel_id, &batch_end)?;
        self.handle_outcome(&group, outcome).await;
        Ok(())
    }

    /// Run one scheduled task through the same serialized channel lane.
    pub async fn run_scheduled_task(&self, task: Task) {
        let Some(group) = self.group_for(&task.channel_id) else {
            tracing::warn!(
                task = %task.id,
                channel = %task.channel_id,
                "scheduled task targets an unregistered channel"
            );
            return;
        };

        let session_id = match task.context_mode {
            crate::store::ContextMode::Group => {
                match self.store.get_session(&group.config.folder) {
                    Ok(session) => session,
                    Err(error) => {
                        tracing::warn!(task = %task.id, %error, "session lookup failed");
                        None
                    }
                }
            }
            crate::store::ContextMode::Isolated => None,
        };

        let invocation = AgentInvocation {
            group: group.clone(),
            prompt: format!("{SCHEDULED_TASK_BANNER}{}", task.prompt),
            session_id,
            is_scheduled_task: true,
            images: Vec::new(),
        };

        match self.invoke_agent(invocation).await {
            Ok(outcome) => self.handle_outcome(&group, outcome).await,
            Err(error) => {
                tracing::warn!(task = %task.id, %error, "scheduled task run failed");
            }
        }
    }

    /// Shared launch path: typing indicator while the agent runs, spawn
    /// registration into the queue, and the runner call itself.
    async fn invoke_agent(&self, invocation: AgentInvocation) -> Result<AgentRunOutcome> {
        let channel_id = invocation.group.channel_id.clone();

        let typing_channel = Arc::clone(&self.channel);
        let typing_target = channel_id.clone();
        let typing = tokio::spawn(async move {
            loop {
                if let Err(error) = typing_channel.send_typing(&typing_target).await {
                    tracing::debug!(channel = %typing_target, %error, "typing indicator failed");
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        });

        let queue = Arc::clone(&self.queue);
        let register_channel = channel_id.clone();
        let on_spawn: SpawnCallback = Box::new(move |handle, container_name| {
            queue.register_process(&register_channel, handle, &container_name);
        });

        let outcome = self.runner.run(invocation, on_spawn).await;
        typing.abort();
        outcome
    }

    /// Persist session rotation and deliver any user-facing reply. Agent
    /// silence (`outputType == log`) is a legal outcome.
    async fn handle_outcome(&self, group: &RegisteredGroup, outcome: AgentRunOutcome) {
        if let Some(new_session_id) = &outcome.new_session_id {
            if let Err(error) = self.store.set_session(&group.config.folder, new_session_id) {
                tracing::warn!(group = %group.config.folder, %error, "failed to persist session");
            }
        }

        let Some(response) = outcome.response else {
            return;
        };
        if response.output_type != OutputType::Message {
            if let Some(log) = response.internal_log {
                tracing::info!(group = %group.config.folder, "agent log: {log}");
            }
            return;
        }
        let Some(text) = response.user_message.filter(|text| !text.is_empty()) else {
            return;
        };

        for chunk in crate::channels::chunker::chunk_message(
            &text,
            self.channel.max_message_length(),
        ) {
            if let Err(error) = self.channel.send(&group.channel_id, &chunk).await {
                // No retry; the agent can always resend via the IPC path.
                tracing::error!(channel = %group.channel_id, %error, "outbound send failed");
                return;
            }
        }
    }
}

/// Normalize a platform timestamp to store format; lexicographic order must
/// match chronology, so anything unparseable becomes "now".
fn normalize_timestamp(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => format_timestamp(parsed.with_timezone(&Utc)),
        Err(_) => now_timestamp(),
    }
}
