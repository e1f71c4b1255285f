//! Per-channel work queue: at most one agent per channel, at most
//! `max_concurrent` agents process-wide, with coalesced message checks, FIFO
//! waiters under the cap, exponential-backoff retry for message processing,
//! and graceful shutdown of in-flight containers.

use crate::container::{ContainerRuntime, ProcessHandle};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const MAX_RETRIES: u32 = 5;
pub const BASE_RETRY_MS: u64 = 5_000;
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Injected by the supervisor; drains a message-check enqueue for a channel
/// and reports success.
pub type MessageProcessor =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// An out-of-band job (scheduled task) bound to a channel.
pub type TaskJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    id: String,
    job: TaskJob,
}

#[derive(Default)]
struct ChannelState {
    active: bool,
    pending_msg: bool,
    pending_tasks: VecDeque<QueuedTask>,
    process: Option<ProcessHandle>,
    container_name: Option<String>,
    retry_count: u32,
}

struct QueueInner {
    channels: HashMap<String, ChannelState>,
    active_count: usize,
    waiting: VecDeque<String>,
    shutting_down: bool,
    processor: Option<MessageProcessor>,
}

pub struct GroupQueue {
    inner: Mutex<QueueInner>,
    max_concurrent: usize,
    retry_base_ms: u64,
    runtime: Option<Arc<ContainerRuntime>>,
    /// Self-handle for the jobs and retry timers this queue spawns.
    this: Weak<GroupQueue>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, runtime: Option<Arc<ContainerRuntime>>) -> Arc<Self> {
        Self::with_retry_base(max_concurrent, runtime, BASE_RETRY_MS)
    }

    /// Constructor with a custom backoff base, used by tests exercising the
    /// retry path.
    pub fn with_retry_base(
        max_concurrent: usize,
        runtime: Option<Arc<ContainerRuntime>>,
        retry_base_ms: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(QueueInner {
                channels: HashMap::new(),
                active_count: 0,
                waiting: VecDeque::new(),
                shutting_down: false,
                processor: None,
            }),
            max_concurrent: max_concurrent.max(1),
            retry_base_ms: retry_base_ms.max(1),
            runtime,
            this: this.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("queue outlives its jobs")
    }

    pub fn set_message_processor(&self, processor: MessageProcessor) {
        let mut inner = self.lock();
        inner.processor = Some(processor);
    }

    /// Idempotent request to process any backlog for the channel.
    ///
    /// While a job is running for the channel this only re-arms the pending
    /// flag, so N calls during one run yield one additional drain pass.
    pub fn enqueue_message_check(&self, channel_id: &str) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }

        let state = inner.channels.entry(channel_id.to_string()).or_default();
        if state.active {
            state.pending_msg = true;
            return;
        }

        if inner.active_count >= self.max_concurrent {
            let state = inner.channels.get_mut(channel_id).expect("state exists");
            state.pending_msg = true;
            Self::push_waiter(&mut inner, channel_id);
            return;
        }

        self.start_message_job(&mut inner, channel_id.to_string());
    }

    /// Submit an out-of-band job for the channel, deduped by `task_id`.
    pub fn enqueue_task(&self, channel_id: &str, task_id: &str, job: TaskJob) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }

        let at_capacity = inner.active_count >= self.max_concurrent;
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        if state.pending_tasks.iter().any(|queued| queued.id == task_id) {
            return;
        }
        state.pending_tasks.push_back(QueuedTask {
            id: task_id.to_string(),
            job,
        });

        let blocked = state.active || at_capacity;
        let active = state.active;
        if blocked {
            if !active {
                Self::push_waiter(&mut inner, channel_id);
            }
            return;
        }

        self.start_task_job(&mut inner, channel_id.to_string());
    }

    /// Called by the runner as soon as a subprocess is spawned, so shutdown
    /// can target it. The queue owns termination from this point on.
    pub fn register_process(
        &self,
        channel_id: &str,
        process: ProcessHandle,
        container_name: &str,
    ) {
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        state.process = Some(process);
        state.container_name = Some(container_name.to_string());
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    // ── Job lifecycle ────────────────────────────────────────────────────────

    fn start_message_job(&self, inner: &mut QueueInner, channel_id: String) {
        let state = inner.channels.entry(channel_id.clone()).or_default();
        state.active = true;
        // Cleared before execution: an enqueue arriving mid-job re-arms it.
        state.pending_msg = false;
        inner.active_count += 1;

        let processor = inner.processor.clone();
        let queue = self.arc();
        tokio::spawn(async move {
            let success = match processor {
                Some(processor) => processor(channel_id.clone()).await,
                None => {
                    tracing::warn!(channel = %channel_id, "no message processor installed");
                    true
                }
            };
            queue.finish_job(&channel_id, Some(success));
        });
    }

    fn start_task_job(&self, inner: &mut QueueInner, channel_id: String) {
        let state = inner.channels.entry(channel_id.clone()).or_default();
        let Some(task) = state.pending_tasks.pop_front() else {
            return;
        };
        state.active = true;
        inner.active_count += 1;

        let queue = self.arc();
        let task_id = task.id;
        let job = task.job;
        tokio::spawn(async move {
            tracing::debug!(channel = %channel_id, task = %task_id, "running scheduled task");
            job.await;
            // Task jobs carry their own error reporting; no retry here.
            queue.finish_job(&channel_id, None);
        });
    }

    fn finish_job(&self, channel_id: &str, message_success: Option<bool>) {
        let mut inner = self.lock();
        {
            let state = inner.channels.entry(channel_id.to_string()).or_default();
            state.active = false;
            state.process = None;
            state.container_name = None;
            if message_success == Some(true) {
                state.retry_count = 0;
            }
        }
        inner.active_count = inner.active_count.saturating_sub(1);

        if message_success == Some(false) {
            self.schedule_retry(&mut inner, channel_id);
        }

        self.drain(&mut inner, channel_id);
    }

    fn schedule_retry(&self, inner: &mut QueueInner, channel_id: &str) {
        if inner.shutting_down {
            return;
        }
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        state.retry_count += 1;
        if state.retry_count > MAX_RETRIES {
            // Give up; a subsequent incoming message re-arms the channel and
            // nothing is lost because the agent watermark was never advanced.
            tracing::warn!(
                channel = %channel_id,
                "message processing failed {MAX_RETRIES} times, dropping batch"
            );
            state.retry_count = 0;
            return;
        }

        let delay = Duration::from_millis(self.retry_base_ms << (state.retry_count - 1));
        tracing::info!(
            channel = %channel_id,
            attempt = state.retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling message retry"
        );

        let queue = self.arc();
        let channel = channel_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !queue.is_shutting_down() {
                queue.enqueue_message_check(&channel);
            }
        });
    }

    /// After a job completes: run the channel's own backlog first (tasks are
    /// preferred because they are not rediscovered from the store), otherwise
    /// hand the freed slot to the waiters.
    fn drain(&self, inner: &mut QueueInner, channel_id: &str) {
        if inner.shutting_down {
            return;
        }

        if inner.active_count < self.max_concurrent {
            let state = inner.channels.entry(channel_id.to_string()).or_default();
            if !state.active {
                let has_task = !state.pending_tasks.is_empty();
                let has_msg = state.pending_msg;
                if has_task {
                    self.start_task_job(inner, channel_id.to_string());
                    return;
                }
                if has_msg {
                    self.start_message_job(inner, channel_id.to_string());
                    return;
                }
            }
        }

        self.drain_waiters(inner);
    }

    fn drain_waiters(&self, inner: &mut QueueInner) {
        while inner.active_count < self.max_concurrent {
            let Some(channel_id) = inner.waiting.pop_front() else {
                return;
            };
            let state = inner.channels.entry(channel_id.clone()).or_default();
            if state.active {
                continue;
            }
            let has_task = !state.pending_tasks.is_empty();
            let has_msg = state.pending_msg;
            if has_task {
                self.start_task_job(inner, channel_id);
            } else if has_msg {
                self.start_message_job(inner, channel_id);
            }
        }
    }

    fn push_waiter(inner: &mut QueueInner, channel_id: &str) {
        if !inner.waiting.iter().any(|waiter| waiter == channel_id) {
            inner.waiting.push_back(channel_id.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Stop accepting work and wind down in-flight agents: `stop` by container
    /// name where known, SIGTERM otherwise, SIGKILL after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let targets: Vec<(String, Option<ProcessHandle>, Option<String>)> = {
            let mut inner = self.lock();
            inner.shutting_down = true;
            inner
                .channels
                .iter()
                .filter(|(_, state)| state.active)
                .map(|(id, state)| {
                    (
                        id.clone(),
                        state.process.clone(),
                        state.container_name.clone(),
                    )
                })
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        tracing::info!(count = targets.len(), "terminating in-flight agents");

        for (channel_id, process, container_name) in &targets {
            match (container_name, &self.runtime) {
                (Some(name), Some(runtime)) => runtime.spawn_stop(name),
                _ => {
                    if let Some(process) = process {
                        process.terminate();
                    } else {
                        tracing::debug!(channel = %channel_id, "no handle to terminate");
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut all_exited = true;
            for (_, process, _) in &targets {
                if let Some(process) = process {
                    if !process.has_exited().await {
                        all_exited = false;
                        break;
                    }
                }
            }
            if all_exited {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        for (channel_id, process, _) in &targets {
            if let Some(process) = process {
                if !process.has_exited().await {
                    tracing::warn!(channel = %channel_id, "grace expired, force-killing agent");
                    process.force_kill().await;
                }
            }
        }
    }
}
