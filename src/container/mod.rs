//! Container runtime integration: CLI detection, health probing, cleanup of
//! leftover agent containers, and handles to live agent subprocesses.

pub mod runner;

pub use runner::{AgentInvocation, AgentRunOutcome, AgentRunner, ContainerRunner, SpawnCallback};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Prefix shared by every agent container this supervisor launches.
pub const CONTAINER_NAME_PREFIX: &str = "nanoclaw-";

const RUNTIME_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Process handle ───────────────────────────────────────────────────────────

/// Handle to a live agent subprocess.
///
/// The runner creates the child but transfers termination authority to the
/// queue via registration; both sides share this handle.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            pid,
            child: Arc::new(tokio::sync::Mutex::new(child)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Politely ask the subprocess to exit.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// Force-kill the subprocess.
    pub async fn force_kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
    }

    pub async fn try_wait(&self) -> Option<std::process::ExitStatus> {
        let mut child = self.child.lock().await;
        child.try_wait().ok().flatten()
    }

    pub async fn has_exited(&self) -> bool {
        self.try_wait().await.is_some()
    }

    /// Wait for exit without holding the lock across the wait, so termination
    /// from the queue stays possible.
    pub async fn wait(&self) -> Result<std::process::ExitStatus> {
        loop {
            {
                let mut child = self.child.lock().await;
                if let Some(status) = child.try_wait().context("Failed to poll subprocess")? {
                    return Ok(status);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// ── Name sanitization ────────────────────────────────────────────────────────

/// Restrict a container name to `[A-Za-z0-9-]+` before it reaches any shell.
pub fn sanitize_container_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
        .collect();
    if sanitized.is_empty() {
        "nanoclaw".to_string()
    } else {
        sanitized
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// The detected container runtime CLI (`container`, `docker`, or the OrbStack
/// docker shim).
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: PathBuf,
}

impl ContainerRuntime {
    /// Locate a container runtime, preferring `container`, then `docker`, then
    /// `~/.orbstack/bin/docker`. Startup aborts when none is present.
    pub fn detect() -> Result<Self> {
        for candidate in ["container", "docker"] {
            if let Some(program) = find_in_path(candidate) {
                return Ok(Self { program });
            }
        }

        if let Some(user_dirs) = directories::UserDirs::new() {
            let orbstack = user_dirs.home_dir().join(".orbstack/bin/docker");
            if orbstack.is_file() {
                return Ok(Self { program: orbstack });
            }
        }

        Err(crate::error::ContainerError::RuntimeMissing.into())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Probe daemon health via `<runtime> info`.
    pub async fn verify(&self) -> Result<()> {
        let mut probe = Command::new(&self.program);
        probe
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(RUNTIME_PROBE_TIMEOUT, probe.output())
            .await
            .map_err(|_| {
                crate::error::ContainerError::RuntimeUnhealthy("`info` probe timed out".into())
            })?
            .context("Failed to run container runtime probe")?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(crate::error::ContainerError::RuntimeUnhealthy(stderr).into())
        }
    }

    /// Remove leftover agent containers from prior unclean exits.
    pub async fn cleanup_stale(&self) -> Result<usize> {
        let output = Command::new(&self.program)
            .args(["ps", "-a", "--format", "{{.Names}}"])
            .output()
            .await
            .context("Failed to list containers")?;

        if !output.status.success() {
            anyhow::bail!(
                "container listing failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(CONTAINER_NAME_PREFIX))
            .map(String::from)
            .collect();

        for name in &names {
            if let Err(error) = self.remove(name).await {
                tracing::warn!(container = %name, %error, "failed to remove stale container");
            }
        }

        Ok(names.len())
    }

    /// Fire-and-forget `stop` for graceful shutdown of a running agent.
    pub fn spawn_stop(&self, name: &str) {
        let name = sanitize_container_name(name);
        let result = Command::new(&self.program)
            .args(["stop", &name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(error) = result {
            tracing::warn!(container = %name, %error, "failed to spawn container stop");
        }
    }

    /// Remove a stopped container.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let name = sanitize_container_name(name);
        let output = Command::new(&self.program)
            .args(["rm", "-f", &name])
            .output()
            .await
            .context("Failed to run container rm")?;

        if output.status.success() {
            Ok(())
        } else {
            anyhow::bail!(
                "container rm {name} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_shell_metacharacters() {
        assert_eq!(
            sanitize_container_name("nanoclaw-g1-abc123"),
            "nanoclaw-g1-abc123"
        );
        assert_eq!(
            sanitize_container_name("nanoclaw-g1; rm -rf /"),
            "nanoclaw-g1rm-rf"
        );
        assert_eq!(sanitize_container_name("$(evil)"), "evil");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_container_name("!!!"), "nanoclaw");
        assert_eq!(sanitize_container_name(""), "nanoclaw");
    }

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }
}
