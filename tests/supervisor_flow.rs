//! End-to-end supervisor scenarios with a stubbed agent runner and a
//! recording chat channel: trigger gating, batch formatting, watermark
//! advancement, retry semantics, and scheduled-task invocations.

use async_trait::async_trait;
use nanoclaw::channels::{Channel, ChannelEvent};
use nanoclaw::config::{Config, MAIN_GROUP_FOLDER};
use nanoclaw::container::runner::{AgentInvocation, AgentRunOutcome, AgentRunner, SpawnCallback};
use nanoclaw::queue::GroupQueue;
use nanoclaw::store::{
    now_timestamp, ContextMode, GroupConfig, RegisteredGroup, ScheduleKind, Store,
};
use nanoclaw::supervisor::{Supervisor, SCHEDULED_TASK_BANNER};
use nanoclaw::wire::{AgentResponse, OutputType};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ── Stubs ────────────────────────────────────────────────────────────────────

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

    async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelEvent>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Scripted runner outcome: a reply, silence, or a transient failure.
enum Scripted {
    Reply(&'static str, &'static str),
    Silent,
    Fail(&'static str),
}

struct StubRunner {
    invocations: Mutex<Vec<AgentInvocation>>,
    script: Mutex<VecDeque<Scripted>>,
}

impl StubRunner {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
        })
    }

    fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for StubRunner {
    async fn run(
        &self,
        invocation: AgentInvocation,
        _on_spawn: SpawnCallback,
    ) -> anyhow::Result<AgentRunOutcome> {
        self.invocations.lock().unwrap().push(invocation);
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Reply(text, session)) => Ok(AgentRunOutcome {
                response: Some(AgentResponse {
                    output_type: OutputType::Message,
                    user_message: Some(text.to_string()),
                    internal_log: None,
                }),
                new_session_id: Some(session.to_string()),
            }),
            Some(Scripted::Silent) | None => Ok(AgentRunOutcome {
                response: Some(AgentResponse {
                    output_type: OutputType::Log,
                    user_message: None,
                    internal_log: Some("nothing to say".into()),
                }),
                new_session_id: None,
            }),
            Some(Scripted::Fail(reason)) => anyhow::bail!("{reason}"),
        }
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    _tmp: TempDir,
    store: Arc<Store>,
    channel: Arc<RecordingChannel>,
    runner: Arc<StubRunner>,
    supervisor: Arc<Supervisor>,
}

fn fixture(script: Vec<Scripted>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(Config {
        data_dir: tmp.path().to_path_buf(),
        assistant_name: "Nano".into(),
        main_channel_id: "CMAIN".into(),
        ..Config::default()
    });
    let store = Arc::new(Store::open(&config.db_path()).unwrap());
    let queue = GroupQueue::new(config.container.max_concurrent, None);
    let channel = RecordingChannel::new();
    let runner = StubRunner::new(script);

    for (channel_id, folder, trigger) in [
        ("CMAIN", MAIN_GROUP_FOLDER, None),
        ("C1", "g1", Some("nano")),
    ] {
        store
            .register_group(&RegisteredGroup {
                channel_id: channel_id.to_string(),
                config: GroupConfig {
                    name: folder.to_string(),
                    folder: folder.to_string(),
                    trigger: trigger.map(String::from),
                    requires_trigger: true,
                    added_at: now_timestamp(),
                    container: None,
                },
            })
            .unwrap();
    }

    let supervisor = Supervisor::new(
        config,
        Arc::clone(&store),
        queue,
        channel.clone(),
        runner.clone(),
    )
    .unwrap();

    Fixture {
        _tmp: tmp,
        store,
        channel,
        runner,
        supervisor,
    }
}

fn event(channel_id: &str, sender: &str, content: &str, time: &str) -> ChannelEvent {
    ChannelEvent {
        channel_id: channel_id.to_string(),
        channel_name: "Test Channel".into(),
        sender: sender.to_string(),
        content: content.to_string(),
        timestamp: time.to_string(),
        mentioned: false,
        reply_to_bot: false,
        attachments: Vec::new(),
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn triggered_message_runs_agent_and_delivers_reply() {
    let fx = fixture(vec![Scripted::Reply("hi", "s1")]);
    fx.supervisor
        .ingest(&event("C1", "u1", "hey nano help", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("C1").await);

    let invocations = fx.runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].prompt.contains(
        "<message sender=\"u1\" time=\"2026-01-01T00:00:01.000Z\">hey nano help</message>"
    ));
    assert!(!invocations[0].is_scheduled_task);

    assert_eq!(fx.channel.sent(), vec![("C1".to_string(), "hi".to_string())]);
    assert_eq!(
        fx.store.last_agent_timestamp("C1").unwrap().as_deref(),
        Some("2026-01-01T00:00:01.000Z")
    );
    assert_eq!(fx.store.get_session("g1").unwrap().as_deref(), Some("s1"));
}

#[tokio::test]
async fn batch_carries_every_pending_message_in_order() {
    let fx = fixture(vec![Scripted::Reply("ok", "s1")]);
    for (time, text) in [
        ("2026-01-01T00:00:02+00:00", "first"),
        ("2026-01-01T00:00:03+00:00", "second nano"),
        ("2026-01-01T00:00:04+00:00", "third"),
    ] {
        fx.supervisor.ingest(&event("C1", "u1", text, time)).unwrap();
    }

    assert!(fx.supervisor.process_channel("C1").await);

    let prompt = &fx.runner.invocations()[0].prompt;
    let first = prompt.find("first").unwrap();
    let second = prompt.find("second nano").unwrap();
    let third = prompt.find("third").unwrap();
    assert!(first < second && second < third);
    assert_eq!(
        fx.store.last_agent_timestamp("C1").unwrap().as_deref(),
        Some("2026-01-01T00:00:04.000Z")
    );
}

#[tokio::test]
async fn untriggered_batch_skips_agent_but_reports_success() {
    let fx = fixture(Vec::new());
    fx.supervisor
        .ingest(&event("C1", "u1", "just chatting", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("C1").await);

    assert!(fx.runner.invocations().is_empty());
    assert!(fx.channel.sent().is_empty());
    // Watermark untouched: a later trigger pulls the whole backlog.
    assert!(fx.store.last_agent_timestamp("C1").unwrap().is_none());
}

#[tokio::test]
async fn main_channel_needs_no_trigger() {
    let fx = fixture(vec![Scripted::Reply("at your service", "s1")]);
    fx.supervisor
        .ingest(&event("CMAIN", "u1", "anything at all", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("CMAIN").await);
    assert_eq!(fx.runner.invocations().len(), 1);
}

#[tokio::test]
async fn runner_failure_reports_failure_and_keeps_watermark() {
    let fx = fixture(vec![Scripted::Fail("container exploded"), Scripted::Reply("recovered", "s1")]);
    fx.supervisor
        .ingest(&event("C1", "u1", "nano do a thing", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(!fx.supervisor.process_channel("C1").await);
    assert!(fx.store.last_agent_timestamp("C1").unwrap().is_none());
    assert!(fx.channel.sent().is_empty());

    // The retry sees the identical batch because nothing advanced.
    assert!(fx.supervisor.process_channel("C1").await);
    assert_eq!(fx.runner.invocations().len(), 2);
    assert_eq!(fx.runner.invocations()[0].prompt, fx.runner.invocations()[1].prompt);
    assert_eq!(
        fx.store.last_agent_timestamp("C1").unwrap().as_deref(),
        Some("2026-01-01T00:00:01.000Z")
    );
}

#[tokio::test]
async fn bot_authored_messages_never_reach_a_prompt() {
    let fx = fixture(vec![Scripted::Reply("ok", "s1")]);
    fx.supervisor
        .ingest(&event("C1", "Nano", "my own earlier reply", "2026-01-01T00:00:01+00:00"))
        .unwrap();
    fx.supervisor
        .ingest(&event("C1", "u1", "nano hello", "2026-01-01T00:00:02+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("C1").await);

    let prompt = &fx.runner.invocations()[0].prompt;
    assert!(!prompt.contains("my own earlier reply"));
    assert!(prompt.contains("nano hello"));
}

#[tokio::test]
async fn empty_backlog_is_success_without_agent_run() {
    let fx = fixture(Vec::new());
    assert!(fx.supervisor.process_channel("C1").await);
    assert!(fx.runner.invocations().is_empty());
}

#[tokio::test]
async fn long_reply_is_chunked_for_delivery() {
    let fx = fixture(Vec::new());
    // Build a reply above the 2000-char platform limit.
    let long_reply: &'static str = Box::leak(
        ("line one\n".repeat(300)).into_boxed_str(),
    );
    {
        let mut script = fx.runner.script.lock().unwrap();
        script.push_back(Scripted::Reply(long_reply, "s1"));
    }
    fx.supervisor
        .ingest(&event("C1", "u1", "nano write a lot", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("C1").await);

    let sent = fx.channel.sent();
    assert!(sent.len() > 1, "reply must be split into chunks");
    assert!(sent.iter().all(|(_, chunk)| chunk.chars().count() <= 2000));
    let reassembled: String = sent.iter().map(|(_, chunk)| chunk.as_str()).collect();
    assert_eq!(reassembled, long_reply);
}

#[tokio::test]
async fn scheduled_task_runs_with_banner_and_isolated_session() {
    let fx = fixture(vec![Scripted::Reply("task done", "s2")]);
    fx.store.set_session("g1", "existing-session").unwrap();
    let task = fx
        .store
        .create_task(
            "g1",
            "C1",
            "check the weather",
            ScheduleKind::Cron,
            "*/5 * * * *",
            ContextMode::Isolated,
            "2026-01-01T00:00:00.000Z",
        )
        .unwrap();

    fx.supervisor.run_scheduled_task(task).await;

    let invocations = fx.runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].prompt.starts_with(SCHEDULED_TASK_BANNER));
    assert!(invocations[0].prompt.contains("check the weather"));
    assert!(invocations[0].is_scheduled_task);
    assert_eq!(invocations[0].session_id, None, "isolated ignores the session");
    assert_eq!(
        fx.channel.sent(),
        vec![("C1".to_string(), "task done".to_string())]
    );
}

#[tokio::test]
async fn scheduled_task_in_group_mode_resumes_the_session() {
    let fx = fixture(vec![Scripted::Reply("done", "s2")]);
    fx.store.set_session("g1", "existing-session").unwrap();
    let task = fx
        .store
        .create_task(
            "g1",
            "C1",
            "summarize the day",
            ScheduleKind::Interval,
            "3600000",
            ContextMode::Group,
            "2026-01-01T00:00:00.000Z",
        )
        .unwrap();

    fx.supervisor.run_scheduled_task(task).await;

    assert_eq!(
        fx.runner.invocations()[0].session_id.as_deref(),
        Some("existing-session")
    );
}

#[tokio::test]
async fn startup_recovery_drives_the_queue() {
    let fx = fixture(vec![Scripted::Reply("caught up", "s1")]);
    fx.supervisor
        .ingest(&event("C1", "u1", "nano catch up", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    // Boot-time recovery must re-enqueue anything past the agent watermark.
    fx.supervisor.startup_recovery().unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && fx.channel.sent().is_empty() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        fx.channel.sent(),
        vec![("C1".to_string(), "caught up".to_string())]
    );
    assert_eq!(
        fx.store.last_agent_timestamp("C1").unwrap().as_deref(),
        Some("2026-01-01T00:00:01.000Z")
    );
}

#[tokio::test]
async fn agent_silence_is_a_legal_outcome() {
    let fx = fixture(vec![Scripted::Silent]);
    fx.supervisor
        .ingest(&event("C1", "u1", "nano are you there", "2026-01-01T00:00:01+00:00"))
        .unwrap();

    assert!(fx.supervisor.process_channel("C1").await);
    assert!(fx.channel.sent().is_empty());
    assert_eq!(
        fx.store.last_agent_timestamp("C1").unwrap().as_deref(),
        Some("2026-01-01T00:00:01.000Z"),
        "silence still consumes the batch"
    );
}
