// ABOUTME: Background reaper evicting sandboxes idle past a threshold
// ABOUTME: Cancellable periodic task that never pins process lifetime

use crate::service::SandboxService;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Handle to the running reaper task. Dropping it (or calling `shutdown`)
/// cancels the task; a spawned task never keeps the process alive on its
/// own, so the reaper is never the reason a shutdown hangs.
pub struct ReaperHandle {
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn shutdown(&self) {
        info!("Idle reaper shutting down");
        self.task.abort();
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Idle reaper: sweeps the registry at a fixed interval and evicts rooms
/// inactive past the idle threshold, independently of in-flight exec calls.
pub struct IdleReaper;

impl IdleReaper {
    /// Spawn the recurring sweep against the given service
    pub fn spawn(service: Arc<SandboxService>) -> ReaperHandle {
        let period = service.settings().reap_interval;

        let task = tokio::spawn(async move {
            info!("Idle reaper started (interval {:?})", period);

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh service
            // is not swept before anything had a chance to run
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = service.sweep_idle().await;
                if evicted > 0 {
                    info!("Idle reaper evicted {} room(s)", evicted);
                } else {
                    debug!("Idle reaper sweep found nothing to evict");
                }
            }
        });

        ReaperHandle { task }
    }
}
