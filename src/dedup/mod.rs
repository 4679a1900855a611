//! Cross-instance request deduplication.
//!
//! Folds concurrent identical fetches into one: within an instance by sharing
//! a pending completion per dedup key, across instances by preferring a
//! peer's in-flight fetch (announced through heartbeats) over launching a new
//! one. A completed fetch is announced with `response-ready` so waiting peers
//! can resolve with a rebuilt clone; abandoned fetches are handled by the
//! liveness-gated timeout, never by cancellation messages.

pub mod bus;
pub mod heartbeat;

pub use bus::{BusHub, BusMessage, BusPayload, DEDUP_BUS, MessageBus, WireResponse};
pub use heartbeat::{HEARTBEAT_INTERVAL, HeartbeatManager, HeartbeatRecord, LIVENESS_WINDOW_MS};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fetch::FetchError;
use crate::store::CachedResponse;
use crate::util::MutexExt;

/// How long a request waits for a fetch result before giving up, absent a
/// live owner.
pub const DEFAULT_DEDUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("deduplicated fetch for `{key}` timed out after {timeout_ms} ms with no live owner")]
    Timeout { key: String, timeout_ms: u64 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("shared fetch for `{key}` failed: {message}")]
    Shared { key: String, message: String },
}

/// Completion value distributed to every waiter of a key. Failures travel as
/// messages so the value stays cloneable across waiters.
type SharedResult = Result<CachedResponse, String>;

enum Claim {
    /// Another local request already owns the key.
    Join(broadcast::Receiver<SharedResult>),
    /// A peer instance owns the key; we registered a pending completion and
    /// wait for its `response-ready`.
    Piggyback(broadcast::Receiver<SharedResult>),
    /// This request owns the fetch.
    Own(broadcast::Sender<SharedResult>),
}

pub struct DedupLayer {
    owner_id: Uuid,
    bus: MessageBus,
    heartbeats: HeartbeatManager,
    in_flight: Mutex<HashMap<String, broadcast::Sender<SharedResult>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DedupLayer {
    /// Create a layer on the given bus and start its listener.
    pub fn new(bus: MessageBus) -> Arc<Self> {
        let owner_id = Uuid::new_v4();
        let mut rx = bus.subscribe();

        let layer = Arc::new(Self {
            owner_id,
            bus: bus.clone(),
            heartbeats: HeartbeatManager::new(owner_id, bus),
            in_flight: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        });

        let weak: Weak<DedupLayer> = Arc::downgrade(&layer);
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let Some(layer) = weak.upgrade() else { break };
                        layer.on_bus_message(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dedup bus receiver lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *layer.listener.lock_or_recover("dedup.new") = Some(listener);

        layer
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Run `fetch` at most once per key across all observable instances.
    ///
    /// Joins an in-flight local fetch when one exists, waits on a live peer's
    /// fetch when heartbeats show one, and otherwise owns the fetch under
    /// `timeout`. Waiters whose timeout fires while the owner still beats
    /// keep waiting for another window.
    pub async fn dedupe<F>(
        &self,
        key: &str,
        fetch: F,
        timeout: Duration,
    ) -> Result<CachedResponse, DedupError>
    where
        F: Future<Output = Result<CachedResponse, FetchError>> + Send,
    {
        let claim = {
            let mut in_flight = self.in_flight.lock_or_recover("dedup.dedupe");
            if let Some(pending) = in_flight.get(key) {
                Claim::Join(pending.subscribe())
            } else if self.heartbeats.is_owner_alive(key) {
                let (tx, rx) = broadcast::channel(1);
                in_flight.insert(key.to_string(), tx);
                Claim::Piggyback(rx)
            } else {
                let (tx, _) = broadcast::channel(1);
                in_flight.insert(key.to_string(), tx.clone());
                Claim::Own(tx)
            }
        };

        match claim {
            Claim::Join(rx) => {
                debug!(key, "joining in-flight local fetch");
                self.await_shared(key, rx, timeout, false).await
            }
            Claim::Piggyback(rx) => {
                debug!(key, "waiting on peer fetch");
                self.await_shared(key, rx, timeout, true).await
            }
            Claim::Own(tx) => self.run_owned(key, tx, fetch, timeout).await,
        }
    }

    /// Tear the layer down: stop listening, end local heartbeats, and fail
    /// any local waiters.
    pub fn dispose(&self) {
        if let Some(listener) = self.listener.lock_or_recover("dedup.dispose").take() {
            listener.abort();
        }

        let pending: Vec<broadcast::Sender<SharedResult>> =
            self.in_flight
                .lock_or_recover("dedup.dispose")
                .drain()
                .map(|(_, tx)| tx)
                .collect();
        for tx in pending {
            let _ = tx.send(Err("instance shutting down".to_string()));
        }

        self.heartbeats.dispose();
    }

    async fn run_owned<F>(
        &self,
        key: &str,
        tx: broadcast::Sender<SharedResult>,
        fetch: F,
        timeout: Duration,
    ) -> Result<CachedResponse, DedupError>
    where
        F: Future<Output = Result<CachedResponse, FetchError>> + Send,
    {
        self.heartbeats.start_heartbeat(key);

        let result = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(response)) => {
                // The fetcher has already written the response store, so a
                // peer that misses this broadcast still converges on retry.
                self.bus.publish(
                    self.owner_id,
                    BusPayload::ResponseReady {
                        key: key.to_string(),
                        response: WireResponse::from_cached(&response),
                    },
                );
                let _ = tx.send(Ok(response.clone()));
                Ok(response)
            }
            Ok(Err(err)) => {
                warn!(key, error = %err, "owned fetch failed");
                let _ = tx.send(Err(err.to_string()));
                Err(DedupError::Fetch(err))
            }
            Err(_) => {
                warn!(
                    key,
                    timeout_ms = timeout.as_millis() as u64,
                    "owned fetch timed out; aborting"
                );
                let _ = tx.send(Err("fetch timed out".to_string()));
                Err(DedupError::Timeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        self.heartbeats.end_heartbeat(key);
        self.release(key);
        result
    }

    async fn await_shared(
        &self,
        key: &str,
        mut rx: broadcast::Receiver<SharedResult>,
        timeout: Duration,
        registered: bool,
    ) -> Result<CachedResponse, DedupError> {
        loop {
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Ok(Ok(response))) => return Ok(response),
                Ok(Ok(Err(message))) => {
                    return Err(DedupError::Shared {
                        key: key.to_string(),
                        message,
                    });
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(DedupError::Shared {
                        key: key.to_string(),
                        message: "pending fetch released without a result".to_string(),
                    });
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Err(_) => {
                    if self.heartbeats.is_owner_alive(key) {
                        debug!(key, "timeout reached but owner still beats; continuing to wait");
                        continue;
                    }
                    if registered {
                        self.release(key);
                    }
                    return Err(DedupError::Timeout {
                        key: key.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    fn on_bus_message(&self, message: BusMessage) {
        // The platform bus does not loop back; neither do we.
        if message.sender == self.owner_id {
            return;
        }

        match message.payload {
            BusPayload::TaskHeartbeat {
                key,
                owner_id,
                timestamp,
            } => {
                self.heartbeats
                    .observe(&key, HeartbeatRecord { timestamp, owner_id });
            }
            BusPayload::TaskEnd { key } => self.heartbeats.forget(&key),
            BusPayload::ResponseReady { key, response } => {
                let pending = self.in_flight.lock_or_recover("dedup.response_ready").remove(&key);
                let Some(tx) = pending else {
                    // No local waiter: nothing to place. The publisher wrote
                    // the store before broadcasting, so the next request
                    // finds the entry there.
                    return;
                };

                match response.into_cached() {
                    Some(cached) => {
                        let _ = tx.send(Ok(cached));
                    }
                    None => {
                        warn!(key, "undecodable response-ready envelope");
                        let _ = tx.send(Err("undecodable peer response".to_string()));
                    }
                }
            }
        }
    }

    fn release(&self, key: &str) {
        self.in_flight.lock_or_recover("dedup.release").remove(key);
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock_or_recover("dedup.in_flight_len").len()
    }
}

impl Drop for DedupLayer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock_or_recover("dedup.drop").take() {
            listener.abort();
        }
    }
}
