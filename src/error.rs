use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for nanoclaw.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum NanoclawError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("container: {0}")]
    Container(#[from] ContainerError),

    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    // Generic fallthrough (wraps anyhow for interop)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Store errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

// ─── Queue errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("no message processor installed")]
    NoProcessor,
}

// ─── Container errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no container runtime found in PATH (tried `container`, `docker`, ~/.orbstack/bin/docker)")]
    RuntimeMissing,

    #[error("container runtime unhealthy: {0}")]
    RuntimeUnhealthy(String),

    #[error("container exited with {status}: {detail}")]
    Exited { status: String, detail: String },

    #[error("agent output missing framing markers")]
    MissingMarkers,

    #[error("agent output unparseable: {0}")]
    BadOutput(String),

    #[error("agent reported error: {0}")]
    AgentError(String),
}

// ─── IPC errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unauthorized: source group {source_group} may not act on {target}")]
    Unauthorized { source_group: String, target: String },
}

// ─── Scheduler errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

// ─── Transport errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel {channel} send failed: {message}")]
    Send { channel: String, message: String },
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, NanoclawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_exit_displays_status() {
        let err = NanoclawError::Container(ContainerError::Exited {
            status: "exit status: 1".into(),
            detail: "agent crashed".into(),
        });
        assert!(err.to_string().contains("exit status: 1"));
        assert!(err.to_string().contains("agent crashed"));
    }

    #[test]
    fn ipc_unauthorized_names_both_groups() {
        let err = NanoclawError::Ipc(IpcError::Unauthorized {
            source_group: "g2".into(),
            target: "g1".into(),
        });
        assert!(err.to_string().contains("g2"));
        assert!(err.to_string().contains("g1"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: NanoclawError = anyhow_err.into();
        assert!(err.to_string().contains("something went wrong"));
    }

    #[test]
    fn scheduler_invalid_cron_displays_expression() {
        let err = NanoclawError::Scheduler(SchedulerError::InvalidCron("* * *".into()));
        assert!(err.to_string().contains("* * *"));
    }
}
