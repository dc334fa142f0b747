// ABOUTME: Core type definitions for room sandboxes
// ABOUTME: Handles, execution modes, container states, and execution results

use serde::{Deserialize, Serialize};

/// Execution mode for a room's sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Each call spawns a fresh interpreter process; nothing persists between calls
    Stateless,
    /// A persistent in-container agent executes all calls against one shared namespace
    Stateful,
}

/// Opaque handle to a room's isolated environment.
/// Owned exclusively by the lifecycle manager; replaced in place on recreate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Room this sandbox belongs to
    pub room_id: String,
    /// Container ID assigned by the runtime
    pub container_id: String,
    /// Execution mode the container was created with
    pub mode: SandboxMode,
    /// Creation timestamp (UTC)
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result of running a code snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Merged stdout + stderr
    pub output: String,
    /// Process exit code, when the execution path reports one
    pub exit_code: Option<i64>,
}

/// Observed container lifecycle state, as reported by an inspect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Absent,
}

/// Raw result of executing a command inside a container
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Merged stdout + stderr as lossy UTF-8, stdout first
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }
}
