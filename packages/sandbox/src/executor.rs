// ABOUTME: Stateless execution engine spawning a fresh interpreter per call
// ABOUTME: Self-heals crashed sandboxes and falls back across interpreter binaries

use crate::error::{Result, SandboxError};
use crate::lifecycle::SandboxManager;
use crate::runtime::ContainerRuntime;
use crate::settings::SandboxSettings;
use crate::types::{ExecutionResult, SandboxHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exit codes the exec shim reports when the binary itself could not be
/// invoked (126: not executable, 127: not found). Anything else means the
/// interpreter launched and the result belongs to the guest program.
fn is_launch_failure(exit_code: i64) -> bool {
    exit_code == 126 || exit_code == 127
}

/// Stateless path: each call spawns `<interpreter> -c <code>` inside the
/// room's container. Interpreter binaries are tried in configured order;
/// only launch-level failures advance the chain.
pub struct StatelessExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
}

impl StatelessExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        Self { runtime, settings }
    }

    /// Run a snippet in the room's sandbox, healing a crashed container
    /// first (restart, then full recreation) so exec stays usable after
    /// crashes without caller intervention.
    pub async fn run(
        &self,
        manager: &SandboxManager,
        handle: &SandboxHandle,
        code: &str,
    ) -> Result<ExecutionResult> {
        let handle = manager.ensure_running(handle).await?;

        let mut attempts: Vec<String> = Vec::new();

        for interpreter in &self.settings.interpreters {
            let cmd = vec![
                interpreter.clone(),
                "-c".to_string(),
                code.to_string(),
            ];

            match self.runtime.exec(&handle.container_id, cmd).await {
                Ok(output) if is_launch_failure(output.exit_code) => {
                    warn!(
                        "Interpreter {} unavailable in room {} (exit {}), trying next",
                        interpreter, handle.room_id, output.exit_code
                    );
                    attempts.push(format!(
                        "{}: exit {} ({})",
                        interpreter,
                        output.exit_code,
                        output.combined().trim()
                    ));
                }
                Ok(output) => {
                    debug!(
                        "Stateless exec in room {} via {} exited {}",
                        handle.room_id, interpreter, output.exit_code
                    );
                    return Ok(ExecutionResult {
                        output: output.combined(),
                        exit_code: Some(output.exit_code),
                    });
                }
                Err(e) => {
                    warn!(
                        "Interpreter {} failed to launch in room {}: {}",
                        interpreter, handle.room_id, e
                    );
                    attempts.push(format!("{}: {}", interpreter, e));
                }
            }
        }

        Err(SandboxError::Execution(format!(
            "all interpreters exhausted for room {}: [{}]",
            handle.room_id,
            attempts.join("; ")
        )))
    }
}
