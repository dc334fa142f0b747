// ABOUTME: Sandbox service facade consumed by the HTTP/WS layer
// ABOUTME: Orchestrates stateful/stateless execution with layered fallback per room

use crate::agent::{AgentClient, AgentReply};
use crate::error::{Result, SandboxError};
use crate::executor::StatelessExecutor;
use crate::lifecycle::SandboxManager;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::settings::SandboxSettings;
use crate::types::SandboxMode;
use std::sync::Arc;
use tracing::{info, warn};

/// Tail of a guest traceback kept when surfacing an execution error; the
/// innermost frames are what operators need.
const TRACEBACK_TAIL_CHARS: usize = 2000;

fn truncate_trace(trace: &str) -> &str {
    let len = trace.chars().count();
    if len <= TRACEBACK_TAIL_CHARS {
        return trace;
    }
    let skip = len - TRACEBACK_TAIL_CHARS;
    let (idx, _) = trace.char_indices().nth(skip).unwrap_or((0, ' '));
    &trace[idx..]
}

/// The Execution Sandbox Manager's external surface: `start`, `exec`,
/// `stop`, `is_ready`. One instance per process; every room operation runs
/// inside that room's critical section, so concurrent calls on one room
/// queue while distinct rooms proceed independently.
pub struct SandboxService {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<Registry>,
    manager: SandboxManager,
    executor: StatelessExecutor,
    agent: AgentClient,
    settings: SandboxSettings,
}

impl SandboxService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        let registry = Arc::new(Registry::new());
        let manager = SandboxManager::new(runtime.clone(), registry.clone(), settings.clone());
        let executor = StatelessExecutor::new(runtime.clone(), settings.clone());
        let agent = AgentClient::new(settings.clone());

        Self {
            runtime,
            registry,
            manager,
            executor,
            agent,
            settings,
        }
    }

    /// Whether the container runtime is currently reachable. Gates whether
    /// requests should be attempted at all; probed fresh on every call so a
    /// daemon that comes up later is picked up without a restart.
    pub async fn is_ready(&self) -> bool {
        self.runtime.ping().await.is_ok()
    }

    /// Ensure a running sandbox for the room (idempotent)
    pub async fn start(&self, room_id: &str) -> Result<()> {
        let lock = self.registry.lock(room_id).await;
        let _guard = lock.lock().await;

        self.manager.start(room_id).await?;
        Ok(())
    }

    /// Run a code snippet in the room's sandbox and return its merged
    /// output. Stateful rooms go through the in-container agent first and
    /// demote silently to the stateless path when the agent is unreachable;
    /// a guest exception is a caller-visible execution error, never a
    /// fallback trigger.
    pub async fn exec(&self, room_id: &str, code: &str) -> Result<String> {
        let lock = self.registry.lock(room_id).await;
        let _guard = lock.lock().await;

        let mut handle = self
            .registry
            .get(room_id)
            .await
            .ok_or_else(|| SandboxError::NotRunning(room_id.to_string()))?;

        self.registry.touch(room_id).await;

        if handle.mode == SandboxMode::Stateful {
            // Heal before talking to the agent; a demotion below must target
            // the same (possibly recreated) container
            handle = self.manager.ensure_running(&handle).await?;
            match self.agent.call(self.runtime.as_ref(), &handle.container_id, code).await {
                Some(AgentReply::Ok { stdout, stderr }) => {
                    return Ok(format!("{}{}", stdout, stderr));
                }
                Some(AgentReply::Err { message, trace }) => {
                    return Err(SandboxError::Execution(format!(
                        "guest code raised: {}\n{}",
                        message,
                        truncate_trace(&trace)
                    )));
                }
                None => {
                    // Agent unavailable or protocol mismatch: demote without
                    // surfacing anything to the caller
                    info!("Agent unavailable for room {}, using stateless path", room_id);
                }
            }
        }

        self.executor
            .run(&self.manager, &handle, code)
            .await
            .map(|result| result.output)
    }

    /// Destroy the room's sandbox. Unknown rooms are a no-op success.
    pub async fn stop(&self, room_id: &str) -> Result<()> {
        {
            let lock = self.registry.lock(room_id).await;
            let _guard = lock.lock().await;
            self.manager.stop(room_id).await?;
        }
        self.registry.prune_lock(room_id).await;
        Ok(())
    }

    /// Rooms with an active sandbox
    pub async fn list_rooms(&self) -> Vec<String> {
        self.registry
            .all_entries()
            .await
            .into_iter()
            .map(|(room, _)| room)
            .collect()
    }

    /// One reaper sweep: evict every room idle past the threshold through
    /// the normal stop path. Individual failures are logged and the sweep
    /// continues. Returns the number of rooms evicted.
    pub async fn sweep_idle(&self) -> usize {
        let mut evicted = 0;

        for (room_id, idle) in self.registry.all_entries().await {
            if idle < self.settings.idle_timeout {
                continue;
            }

            let stopped = {
                let lock = self.registry.lock(&room_id).await;
                let _guard = lock.lock().await;

                // Re-check under the lock: an exec may have touched the room
                // while the sweep was waiting for it
                let still_idle = self
                    .registry
                    .all_entries()
                    .await
                    .into_iter()
                    .any(|(room, idle)| room == room_id && idle >= self.settings.idle_timeout);
                if !still_idle {
                    false
                } else {
                    info!("Evicting idle room {} (idle {:?})", room_id, idle);
                    match self.manager.stop(&room_id).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Idle eviction of room {} failed: {}", room_id, e);
                            false
                        }
                    }
                }
            };

            if stopped {
                evicted += 1;
                self.registry.prune_lock(&room_id).await;
            }
        }

        evicted
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }
}
