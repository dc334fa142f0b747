// ABOUTME: In-memory registry mapping rooms to sandbox handles and activity
// ABOUTME: Per-room critical sections serialize start/exec/stop/eviction

use crate::types::SandboxHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

struct Entry {
    handle: SandboxHandle,
    // Replaced with Instant::now() on every touch, so monotonically
    // non-decreasing for the lifetime of the entry.
    last_active: Instant,
}

/// Room → sandbox registry. Instantiated once per process and passed to the
/// other components; never a global, so tests construct isolated instances.
/// The handle and its activity record live in one entry and are created and
/// removed atomically together.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-room critical section. All operations touching one room's
    /// entry (start, exec, stop, reaper eviction) serialize through this;
    /// distinct rooms proceed concurrently.
    pub async fn lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get(&self, room_id: &str) -> Option<SandboxHandle> {
        let entries = self.entries.read().await;
        entries.get(room_id).map(|e| e.handle.clone())
    }

    pub async fn put(&self, handle: SandboxHandle) {
        let mut entries = self.entries.write().await;
        entries.insert(
            handle.room_id.clone(),
            Entry {
                handle,
                last_active: Instant::now(),
            },
        );
    }

    pub async fn remove(&self, room_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(room_id);
    }

    /// Drop a room's lock once no task holds or awaits it, keeping the lock
    /// map from growing one entry per room ever seen. Callers invoke this
    /// after a room is destroyed and its guard has been released; a lock
    /// some other task is still queued on is left in place.
    pub async fn prune_lock(&self, room_id: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(room_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(room_id);
            }
        }
    }

    /// Number of room locks currently tracked
    pub async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Bump a room's activity timestamp; no-op if the room is not registered
    pub async fn touch(&self, room_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(room_id) {
            entry.last_active = Instant::now();
        }
    }

    /// Snapshot of every room and how long it has been idle
    pub async fn all_entries(&self) -> Vec<(String, Duration)> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        entries
            .iter()
            .map(|(room, e)| (room.clone(), now.duration_since(e.last_active)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
