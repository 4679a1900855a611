//! Fetch-ownership heartbeats.
//!
//! While an instance owns an in-flight fetch it beats on the bus every
//! 500 ms; peers treat a record younger than two beat intervals as proof of a
//! live owner. Records are kept per key and cleared on `task-end` or
//! disposal.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::util::{MutexExt, RwLockExt, now_ms};

use super::bus::{BusPayload, MessageBus};

/// Cadence of `task-heartbeat` messages for an owned fetch.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// A record older than this is a dead owner (2 x the beat interval).
pub const LIVENESS_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub timestamp: u64,
    pub owner_id: Uuid,
}

pub struct HeartbeatManager {
    owner_id: Uuid,
    bus: MessageBus,
    remote: RwLock<HashMap<String, HeartbeatRecord>>,
    local: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(owner_id: Uuid, bus: MessageBus) -> Self {
        Self {
            owner_id,
            bus,
            remote: RwLock::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Record a peer's heartbeat.
    pub fn observe(&self, key: &str, record: HeartbeatRecord) {
        self.remote.write_or_recover("heartbeat.observe").insert(key.to_string(), record);
    }

    /// Drop the record for a finished peer fetch.
    pub fn forget(&self, key: &str) {
        self.remote.write_or_recover("heartbeat.forget").remove(key);
    }

    /// Whether some peer's fetch of `key` showed a heartbeat within the
    /// liveness window.
    pub fn is_owner_alive(&self, key: &str) -> bool {
        self.remote.read_or_recover("heartbeat.is_owner_alive")
            .get(key)
            .is_some_and(|record| now_ms().saturating_sub(record.timestamp) < LIVENESS_WINDOW_MS)
    }

    /// Start beating for an owned fetch. The first beat is published
    /// immediately so peers can piggyback without waiting an interval.
    pub fn start_heartbeat(&self, key: &str) {
        let bus = self.bus.clone();
        let owner_id = self.owner_id;
        let beat_key = key.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                bus.publish(
                    owner_id,
                    BusPayload::TaskHeartbeat {
                        key: beat_key.clone(),
                        owner_id,
                        timestamp: now_ms(),
                    },
                );
            }
        });

        if let Some(previous) =
            self.local
                .lock_or_recover("heartbeat.start_heartbeat")
                .insert(key.to_string(), handle)
        {
            previous.abort();
        }
    }

    /// Stop beating for `key` and tell peers the task ended.
    pub fn end_heartbeat(&self, key: &str) {
        if let Some(handle) = self.local.lock_or_recover("heartbeat.end_heartbeat").remove(key) {
            handle.abort();
            self.bus
                .publish(self.owner_id, BusPayload::TaskEnd { key: key.to_string() });
        }
    }

    /// End every local heartbeat and clear the tables. Called on instance
    /// teardown.
    pub fn dispose(&self) {
        let local: Vec<(String, JoinHandle<()>)> = self
            .local
            .lock_or_recover("heartbeat.dispose")
            .drain()
            .collect();
        for (key, handle) in local {
            handle.abort();
            self.bus
                .publish(self.owner_id, BusPayload::TaskEnd { key });
        }
        self.remote.write_or_recover("heartbeat.dispose").clear();
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::bus::{BusHub, BusMessage, DEDUP_BUS};

    fn manager() -> (HeartbeatManager, MessageBus) {
        let bus = BusHub::new().open(DEDUP_BUS);
        (HeartbeatManager::new(Uuid::new_v4(), bus.clone()), bus)
    }

    #[test]
    fn fresh_record_means_alive() {
        let (manager, _bus) = manager();
        manager.observe(
            "k",
            HeartbeatRecord {
                timestamp: now_ms(),
                owner_id: Uuid::new_v4(),
            },
        );
        assert!(manager.is_owner_alive("k"));
    }

    #[test]
    fn old_record_means_dead() {
        let (manager, _bus) = manager();
        manager.observe(
            "k",
            HeartbeatRecord {
                timestamp: now_ms().saturating_sub(LIVENESS_WINDOW_MS + 1),
                owner_id: Uuid::new_v4(),
            },
        );
        assert!(!manager.is_owner_alive("k"));
    }

    #[test]
    fn forget_clears_the_record() {
        let (manager, _bus) = manager();
        manager.observe(
            "k",
            HeartbeatRecord {
                timestamp: now_ms(),
                owner_id: Uuid::new_v4(),
            },
        );
        manager.forget("k");
        assert!(!manager.is_owner_alive("k"));
    }

    #[tokio::test]
    async fn start_heartbeat_publishes_immediately() {
        let (manager, bus) = manager();
        let mut rx = bus.subscribe();

        manager.start_heartbeat("k");

        let message = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("first beat within one interval")
            .expect("bus open");
        assert!(matches!(
            message.payload,
            BusPayload::TaskHeartbeat { ref key, .. } if key == "k"
        ));

        manager.end_heartbeat("k");
    }

    #[tokio::test]
    async fn end_heartbeat_broadcasts_task_end() {
        let (manager, bus) = manager();
        manager.start_heartbeat("k");

        let mut rx = bus.subscribe();
        manager.end_heartbeat("k");

        let mut saw_task_end = false;
        while let Ok(Ok(BusMessage { payload, .. })) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            if matches!(payload, BusPayload::TaskEnd { ref key } if key == "k") {
                saw_task_end = true;
                break;
            }
        }
        assert!(saw_task_end);
    }

    #[tokio::test]
    async fn dispose_ends_all_local_heartbeats() {
        let (manager, bus) = manager();
        manager.start_heartbeat("a");
        manager.start_heartbeat("b");
        manager.observe(
            "peer",
            HeartbeatRecord {
                timestamp: now_ms(),
                owner_id: Uuid::new_v4(),
            },
        );

        let mut rx = bus.subscribe();
        manager.dispose();

        let mut ended = Vec::new();
        while let Ok(Ok(BusMessage { payload, .. })) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            if let BusPayload::TaskEnd { key } = payload {
                ended.push(key);
                if ended.len() == 2 {
                    break;
                }
            }
        }
        ended.sort();
        assert_eq!(ended, vec!["a".to_string(), "b".to_string()]);
        assert!(!manager.is_owner_alive("peer"));
    }
}
