// ABOUTME: Fixed sandbox policy settings with environment overrides
// ABOUTME: Image, resource caps, execution mode, and reaper/stop timing

use crate::types::SandboxMode;
use std::time::Duration;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SCRIBBLE_SANDBOX_";

/// Sandbox policy. Fixed per process; callers cannot vary it per request.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Base guest-runtime image every room container is created from
    pub image: String,
    /// Memory ceiling per container, in megabytes
    pub memory_mb: u64,
    /// CPU share per container, in units of 1e-9 cores (5e8 = half a core)
    pub cpu_nano_cores: i64,
    /// Execution mode new sandboxes are created with
    pub mode: SandboxMode,
    /// Inactivity threshold after which the reaper evicts a room
    pub idle_timeout: Duration,
    /// Interval between reaper sweeps
    pub reap_interval: Duration,
    /// Bound on the graceful-stop wait before a forceful kill is raced in
    pub stop_wait: Duration,
    /// Container name prefix; the room ID is appended for reattachment
    pub name_prefix: String,
    /// Well-known Unix socket path the in-container agent binds
    pub agent_socket: String,
    /// Interpreter binaries tried in order by the stateless path
    pub interpreters: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            memory_mb: 128,
            cpu_nano_cores: 500_000_000,
            mode: SandboxMode::Stateless,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            stop_wait: Duration::from_secs(3),
            name_prefix: "scribble-room-".to_string(),
            agent_socket: "/tmp/scribble-agent.sock".to_string(),
            interpreters: vec!["python3".to_string(), "python".to_string()],
        }
    }
}

impl SandboxSettings {
    /// Defaults overlaid with any `SCRIBBLE_SANDBOX_*` environment overrides
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(image) = env_var("IMAGE") {
            settings.image = image;
        }
        if let Some(mb) = env_var("MEMORY_MB").and_then(|v| v.parse().ok()) {
            settings.memory_mb = mb;
        }
        if let Some(mode) = env_var("MODE") {
            settings.mode = match mode.to_lowercase().as_str() {
                "stateful" => SandboxMode::Stateful,
                _ => SandboxMode::Stateless,
            };
        }
        if let Some(secs) = env_var("IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            settings.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_var("REAP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            settings.reap_interval = Duration::from_secs(secs);
        }

        settings
    }

    /// Container name for a room, used both at creation and for
    /// leftover discovery after a service crash
    pub fn container_name(&self, room_id: &str) -> String {
        format!("{}{}", self.name_prefix, room_id)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.is_empty())
}
