//! Active-policy ownership.
//!
//! The store holds the currently effective [`CachePolicy`] (if any), mirrors
//! it into the durable record when the envelope carries a `configTTL`, and
//! notifies registered observers after every in-memory transition. Observers
//! fire on every `set` call; collapsing byte-identical deliveries is the sync
//! client's job, not the store's.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::util::{MutexExt, RwLockExt, now_ms};

use super::{CachePolicy, CacheSettings, PolicyDb, PrefetchMode};

/// Callbacks fired after the store's in-memory state has been updated.
#[async_trait]
pub trait PolicyObserver: Send + Sync {
    async fn on_set(&self, policy: Arc<CachePolicy>);
    async fn on_reset(&self);
}

pub struct PolicyStore {
    weak: Weak<PolicyStore>,
    active: RwLock<Option<Arc<CachePolicy>>>,
    db: Option<PolicyDb>,
    observers: RwLock<Vec<Arc<dyn PolicyObserver>>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyStore {
    /// Create a store, optionally backed by a durable policy record.
    pub fn new(db: Option<PolicyDb>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            active: RwLock::new(None),
            db,
            observers: RwLock::new(Vec::new()),
            expiry: Mutex::new(None),
        })
    }

    /// Register an observer. Registration order is notification order.
    pub fn subscribe(&self, observer: Arc<dyn PolicyObserver>) {
        self.observers.write_or_recover("policy_store.subscribe").push(observer);
    }

    /// Immutable snapshot of the active policy.
    pub fn snapshot(&self) -> Option<Arc<CachePolicy>> {
        self.active.read_or_recover("policy_store.snapshot").clone()
    }

    /// Replace the active policy.
    ///
    /// A non-null policy with `configTTL > 0` is persisted and scheduled for
    /// expiry; any other value clears the persisted record. Persistence
    /// failures never prevent the in-memory replacement.
    pub async fn set(&self, policy: Option<CachePolicy>) {
        self.cancel_expiry();

        match policy {
            Some(policy) => {
                let policy = Arc::new(policy);
                *self.active.write_or_recover("policy_store.set") = Some(policy.clone());

                match policy.config_ttl.filter(|ttl| *ttl > 0) {
                    Some(ttl) => {
                        self.persist_latest(&policy).await;
                        self.schedule_expiry(ttl);
                    }
                    None => self.clear_persisted().await,
                }

                info!(
                    hosts = policy.hosts.len(),
                    config_ttl_ms = policy.config_ttl.unwrap_or(0),
                    "cache policy set"
                );
                for observer in self.observer_snapshot() {
                    observer.on_set(policy.clone()).await;
                }
            }
            None => {
                *self.active.write_or_recover("policy_store.set") = None;
                self.clear_persisted().await;

                info!("cache policy reset");
                for observer in self.observer_snapshot() {
                    observer.on_reset().await;
                }
            }
        }
    }

    /// Equivalent to `set(None)`.
    pub async fn reset(&self) {
        self.set(None).await;
    }

    /// Adopt the persisted policy when its `configTTL` window has not yet
    /// elapsed; otherwise drop the stale record.
    ///
    /// Adoption restores state from a policy that already went through `set`
    /// in a previous run, so observers are not re-notified.
    pub async fn load_from_persistence_if_valid(&self) -> bool {
        let Some(db) = &self.db else {
            return false;
        };

        let record = match db.latest().await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "failed to read persisted policy; discarding");
                self.clear_persisted().await;
                return false;
            }
        };

        let config_ttl = record.policy.config_ttl.unwrap_or(0);
        let deadline = record.saved_at.saturating_add(config_ttl);
        let now = now_ms();

        if config_ttl == 0 || deadline <= now {
            debug!(
                saved_at = record.saved_at,
                config_ttl_ms = config_ttl,
                "persisted policy expired; clearing"
            );
            self.clear_persisted().await;
            return false;
        }

        *self.active.write_or_recover("policy_store.load_from_persistence") =
            Some(Arc::new(record.policy));
        self.schedule_expiry(deadline - now);

        info!(
            remaining_ms = deadline - now,
            "adopted persisted cache policy"
        );
        true
    }

    /// Merged settings for an intercepted request, or `None` when the request
    /// must bypass the cache.
    pub fn resolve_request_settings(
        &self,
        request: &Request<Bytes>,
        ignore_origins: &[String],
    ) -> Option<CacheSettings> {
        let origin = request_origin(request)?;
        if ignore_origins.iter().any(|ignored| *ignored == origin) {
            return None;
        }

        self.snapshot()?
            .resolve(&origin, request.uri().path(), request.method().as_str())
    }

    /// Synthetic requests for every declared triple whose merged prefetch
    /// mode is in `modes`.
    pub fn prefetch_targets(&self, modes: &[PrefetchMode]) -> Vec<Request<Bytes>> {
        let Some(policy) = self.snapshot() else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        for target in policy.declared_targets() {
            let Some(settings) = policy.resolve(&target.origin, &target.path, &target.method)
            else {
                continue;
            };
            if !modes.contains(&settings.prefetch) {
                continue;
            }

            let method = match Method::from_bytes(target.method.as_bytes()) {
                Ok(method) => method,
                Err(_) => {
                    warn!(method = %target.method, "skipping prefetch target with invalid method");
                    continue;
                }
            };
            let uri = format!("{}/{}", target.origin, target.path);
            match Request::builder().method(method).uri(uri).body(Bytes::new()) {
                Ok(request) => requests.push(request),
                Err(err) => {
                    warn!(
                        origin = %target.origin,
                        path = %target.path,
                        error = %err,
                        "skipping unbuildable prefetch target"
                    );
                }
            }
        }
        requests
    }

    /// Cancel the expiry timer. Called on engine teardown.
    pub fn shutdown(&self) {
        self.cancel_expiry();
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn PolicyObserver>> {
        self.observers.read_or_recover("policy_store.observer_snapshot").clone()
    }

    fn schedule_expiry(&self, delay_ms: u64) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(store) = weak.upgrade() {
                debug!(delay_ms, "policy configTTL elapsed; resetting");
                // Detach this task's own handle first: the reset below
                // cancels pending expiry timers, and this task must not
                // abort itself mid-reset.
                drop(store.expiry.lock_or_recover("policy_store.expiry_fired").take());
                store.reset().await;
            }
        });

        if let Some(previous) = self
            .expiry
            .lock_or_recover("policy_store.schedule_expiry")
            .replace(handle)
        {
            previous.abort();
        }
    }

    fn cancel_expiry(&self) {
        if let Some(handle) = self.expiry.lock_or_recover("policy_store.cancel_expiry").take() {
            handle.abort();
        }
    }

    async fn persist_latest(&self, policy: &CachePolicy) {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(err) = db.put_latest(policy, now_ms()).await {
            warn!(error = %err, "failed to persist cache policy");
        }
    }

    async fn clear_persisted(&self) {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(err) = db.clear_latest().await {
            warn!(error = %err, "failed to clear persisted cache policy");
        }
    }
}

impl Drop for PolicyStore {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}

fn request_origin(request: &Request<Bytes>) -> Option<String> {
    let scheme = request.uri().scheme_str()?;
    let authority = request.uri().authority()?;
    Some(format!("{scheme}://{authority}"))
}
