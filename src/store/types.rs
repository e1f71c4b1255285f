use serde::{Deserialize, Serialize};

/// An ingested chat event. Rows are append-only.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_name: String,
    pub content: String,
    /// Fixed-width UTC RFC-3339 so lexicographic order is chronological.
    pub timestamp: String,
    pub mentions_bot: bool,
}

/// Channel metadata kept for discovery, including unregistered channels.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
}

/// A chat endpoint the supervisor serves, with its working-directory folder.
#[derive(Debug, Clone)]
pub struct RegisteredGroup {
    pub channel_id: String,
    pub config: GroupConfig,
}

impl RegisteredGroup {
    pub fn is_main(&self) -> bool {
        self.config.folder == crate::config::MAIN_GROUP_FOLDER
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Filesystem-safe unique slug; doubles as the IPC source identity.
    pub folder: String,
    /// Per-group trigger pattern overriding the assistant-name default.
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default = "default_true")]
    pub requires_trigger: bool,
    pub added_at: String,
    #[serde(default, rename = "containerConfig")]
    pub container: Option<ContainerOverrides>,
}

fn default_true() -> bool {
    true
}

/// Per-group overrides for the hardened container launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverrides {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub cap_drop: Option<bool>,
    #[serde(default)]
    pub tmpfs: Option<bool>,
    #[serde(default)]
    pub no_new_privileges: Option<bool>,
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(Self::Cron),
            "interval" => Some(Self::Interval),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Task runs inside the group's persistent session.
    Group,
    /// Task runs with a fresh session.
    Isolated,
}

impl ContextMode {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Isolated => "isolated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(Self::Group),
            "isolated" => Some(Self::Isolated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
}

impl TaskStatus {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("paused") {
            Self::Paused
        } else {
            Self::Active
        }
    }
}

/// A scheduled future agent invocation.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub group_folder: String,
    pub channel_id: String,
    pub prompt: String,
    pub schedule_kind: ScheduleKind,
    /// Cron expression, interval milliseconds, or one-shot timestamp.
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub status: TaskStatus,
    pub next_run: Option<String>,
    pub created_at: String,
}
