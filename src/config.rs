use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Folder slug of the privileged main group.
pub const MAIN_GROUP_FOLDER: &str = "main";

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root data directory (database, IPC drop dirs) — computed, not serialized.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml — computed, not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Display name of the assistant; also the default trigger word.
    pub assistant_name: String,
    /// Channel id of the privileged main channel.
    pub main_channel_id: String,
    /// IANA timezone name used for cron evaluation.
    pub timezone: String,

    /// Directory holding per-group working mounts.
    #[serde(default)]
    pub groups_dir: Option<PathBuf>,

    #[serde(default)]
    pub intervals: IntervalsConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub gemini: GeminiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    /// Message poll cadence for the supervisor loop.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// IPC directory scan cadence.
    #[serde(default = "default_ipc_poll_ms")]
    pub ipc_poll_ms: u64,
    /// Scheduler tick cadence.
    #[serde(default = "default_scheduler_secs")]
    pub scheduler_secs: u64,
    /// Grace period before in-flight containers are force-killed on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Agent image; rebuilt out-of-band.
    #[serde(default = "default_image")]
    pub image: String,
    /// Process-wide cap on concurrently running agent containers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: String,
    /// Project root mounted into the main group's container.
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Model passed through to the sandbox via GEMINI_MODEL.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_poll_ms() -> u64 {
    2_000
}
fn default_ipc_poll_ms() -> u64 {
    500
}
fn default_scheduler_secs() -> u64 {
    10
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}
fn default_image() -> String {
    "nanoclaw-agent:latest".into()
}
fn default_max_concurrent() -> usize {
    5
}
fn default_memory() -> String {
    "512m".into()
}
fn default_cpus() -> String {
    "1".into()
}
fn default_model() -> String {
    "gemini-2.5-flash".into()
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            ipc_poll_ms: default_ipc_poll_ms(),
            scheduler_secs: default_scheduler_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            max_concurrent: default_max_concurrent(),
            memory: default_memory(),
            cpus: default_cpus(),
            project_dir: None,
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            config_path: PathBuf::from("config.toml"),
            assistant_name: "Nano".into(),
            main_channel_id: "main".into(),
            timezone: "UTC".into(),
            groups_dir: None,
            intervals: IntervalsConfig::default(),
            container: ContainerConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `{data_dir}/config.toml`, writing defaults on first run.
    pub fn load_or_init(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let toml_str =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            fs::write(&config_path, toml_str).context("Failed to write config file")?;
            config
        };

        config.data_dir = data_dir.to_path_buf();
        config.config_path = config_path;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("NANOCLAW_ASSISTANT_NAME") {
            if !name.is_empty() {
                self.assistant_name = name;
            }
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            if !model.is_empty() {
                self.gemini.model = model;
            }
        }
        if let Ok(tz) = std::env::var("NANOCLAW_TIMEZONE") {
            if !tz.is_empty() {
                self.timezone = tz;
            }
        }
        if let Ok(raw) = std::env::var("MAX_CONCURRENT_CONTAINERS") {
            if let Ok(n) = raw.parse::<usize>() {
                if n > 0 {
                    self.container.max_concurrent = n;
                }
            }
        }
    }

    /// The Gemini API key, resolved from the environment only — never persisted.
    pub fn gemini_api_key(&self) -> Result<String> {
        std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .context("GEMINI_API_KEY is not set")
    }

    /// Directory holding per-group working mounts.
    pub fn groups_dir(&self) -> PathBuf {
        self.groups_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("groups"))
    }

    /// Root of the per-group IPC drop directories.
    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("nanoclaw.db")
    }

    /// Timezone for cron evaluation; falls back to UTC on an unknown name.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown timezone '{}', falling back to UTC", self.timezone);
            chrono_tz::Tz::UTC
        })
    }
}
