// ABOUTME: Sandbox lifecycle manager: create, reattach, restart, destroy
// ABOUTME: Enforces one sandbox per room and keeps registry state consistent across crashes

use crate::agent::agent_command;
use crate::error::{Result, SandboxError};
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::settings::SandboxSettings;
use crate::types::{ContainerState, SandboxHandle, SandboxMode};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Creates, reattaches, restarts, and destroys room sandboxes.
/// Callers must hold the room's registry lock around every method; the
/// manager itself never takes it.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<Registry>,
    settings: SandboxSettings,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<Registry>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            runtime,
            registry,
            settings,
        }
    }

    fn spec_for(&self, room_id: &str) -> ContainerSpec {
        let cmd = match self.settings.mode {
            // Stateless containers only need to exist so exec can target them
            SandboxMode::Stateless => vec!["sleep".to_string(), "infinity".to_string()],
            SandboxMode::Stateful => agent_command(&self.settings),
        };

        ContainerSpec {
            image: self.settings.image.clone(),
            memory_mb: self.settings.memory_mb,
            cpu_nano_cores: self.settings.cpu_nano_cores,
            cmd,
            room_id: room_id.to_string(),
        }
    }

    /// Ensure a running sandbox for the room. Idempotent: an existing entry
    /// is touched and returned; a leftover container surviving a service
    /// crash is reattached by name; otherwise a fresh environment is
    /// created. On creation failure no partial registry entry remains.
    pub async fn start(&self, room_id: &str) -> Result<SandboxHandle> {
        if let Some(handle) = self.registry.get(room_id).await {
            debug!("Room {} already has sandbox {}", room_id, handle.container_id);
            self.registry.touch(room_id).await;
            return Ok(handle);
        }

        let name = self.settings.container_name(room_id);
        if let Some((container_id, state)) = self.runtime.find_by_name(&name).await? {
            info!("Reattaching leftover container {} for room {}", container_id, room_id);
            if state != ContainerState::Running {
                self.runtime.start(&container_id).await?;
            }
            let handle = SandboxHandle {
                room_id: room_id.to_string(),
                container_id,
                mode: self.settings.mode,
                created_at: Utc::now(),
            };
            self.registry.put(handle.clone()).await;
            return Ok(handle);
        }

        self.create(room_id).await
    }

    /// Create a fresh environment for the room and register it
    pub async fn create(&self, room_id: &str) -> Result<SandboxHandle> {
        let name = self.settings.container_name(room_id);
        let container_id = self.runtime.create(&name, &self.spec_for(room_id)).await?;

        if let Err(e) = self.runtime.start(&container_id).await {
            // Never leave a half-created sandbox behind
            warn!("Start after create failed for room {}: {}", room_id, e);
            let _ = self.runtime.remove(&container_id, true).await;
            return Err(e);
        }

        let handle = SandboxHandle {
            room_id: room_id.to_string(),
            container_id,
            mode: self.settings.mode,
            created_at: Utc::now(),
        };
        self.registry.put(handle.clone()).await;
        info!("Created sandbox {} for room {}", handle.container_id, room_id);
        Ok(handle)
    }

    /// Verify the room's container is actually running, healing lazily:
    /// a crashed container is restarted, and if that fails (or it vanished
    /// entirely) the sandbox is recreated from scratch, replacing the
    /// handle in place.
    pub async fn ensure_running(&self, handle: &SandboxHandle) -> Result<SandboxHandle> {
        match self.runtime.inspect(&handle.container_id).await? {
            ContainerState::Running => Ok(handle.clone()),
            ContainerState::Stopped => {
                warn!(
                    "Sandbox {} for room {} found stopped, restarting",
                    handle.container_id, handle.room_id
                );
                match self.runtime.start(&handle.container_id).await {
                    Ok(()) => Ok(handle.clone()),
                    Err(e) => {
                        warn!(
                            "Restart failed for room {} ({}), recreating",
                            handle.room_id, e
                        );
                        self.recreate(handle).await
                    }
                }
            }
            ContainerState::Absent => {
                warn!(
                    "Sandbox {} for room {} vanished, recreating",
                    handle.container_id, handle.room_id
                );
                self.recreate(handle).await
            }
        }
    }

    async fn recreate(&self, old: &SandboxHandle) -> Result<SandboxHandle> {
        let _ = self.runtime.remove(&old.container_id, true).await;
        self.create(&old.room_id).await
    }

    /// Stop the room's sandbox and drop its registry entry. No entry is a
    /// no-op success. A graceful stop is bounded by `stop_wait`; on timeout
    /// a forceful kill races the still-pending graceful path and the first
    /// completion wins. Underlying stop failures are logged, never thrown:
    /// the registry entry is always removed.
    pub async fn stop(&self, room_id: &str) -> Result<()> {
        let Some(handle) = self.registry.get(room_id).await else {
            debug!("Stop for unknown room {} is a no-op", room_id);
            return Ok(());
        };

        let state = self
            .runtime
            .inspect(&handle.container_id)
            .await
            .unwrap_or(ContainerState::Absent);

        if state == ContainerState::Running {
            self.stop_or_kill(&handle).await;
        }

        if let Err(e) = self.runtime.remove(&handle.container_id, true).await {
            warn!(
                "Best-effort removal of container {} failed: {}",
                handle.container_id, e
            );
        }

        self.registry.remove(room_id).await;
        info!("Stopped sandbox for room {}", room_id);
        Ok(())
    }

    async fn stop_or_kill(&self, handle: &SandboxHandle) {
        let wait_secs = self.settings.stop_wait.as_secs().max(1);
        let graceful = self.runtime.stop(&handle.container_id, wait_secs);
        tokio::pin!(graceful);

        let result = tokio::select! {
            res = &mut graceful => res,
            _ = sleep(self.settings.stop_wait) => {
                warn!(
                    "Graceful stop of {} exceeded {:?}, racing a kill",
                    handle.container_id, self.settings.stop_wait
                );
                tokio::select! {
                    res = &mut graceful => res,
                    res = self.runtime.kill(&handle.container_id) => res,
                }
            }
        };

        if let Err(stop_err) = result {
            if let Err(kill_err) = self.runtime.kill(&handle.container_id).await {
                let err = SandboxError::Stop(format!(
                    "graceful: {}; kill: {}",
                    stop_err, kill_err
                ));
                error!("Stop failed for room {}: {}", handle.room_id, err);
            }
        }
    }
}
