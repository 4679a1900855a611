//! Per-request state machine.
//!
//! Every intercepted request runs resolve -> key -> lookup -> fetch: resolve
//! the merged policy settings (no settings means the request bypasses the
//! engine entirely), derive the cache key, serve a fresh stored entry, and
//! otherwise fetch through the deduplication layer and write back successful
//! responses. The same pipeline executes prefetch warm-up sweeps.

pub mod key;

pub use key::{KeyError, RevertedRequest, cache_key, revert_key};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dedup::{DEFAULT_DEDUP_TIMEOUT, DedupError, DedupLayer};
use crate::fetch::{FetchError, Fetcher};
use crate::policy::{Freshness, PolicyStore, PrefetchMode, freshness};
use crate::store::{CachedResponse, ResponseStore};
use crate::util::now_ms;

const METRIC_REQUESTS: &str = "raffica_pipeline_requests_total";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
}

pub struct RequestPipeline {
    policy: Arc<PolicyStore>,
    store: ResponseStore,
    dedup: Arc<DedupLayer>,
    fetcher: Arc<dyn Fetcher>,
    ignore_origins: Vec<String>,
    dedup_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        policy: Arc<PolicyStore>,
        store: ResponseStore,
        dedup: Arc<DedupLayer>,
        fetcher: Arc<dyn Fetcher>,
        ignore_origins: Vec<String>,
    ) -> Self {
        Self {
            policy,
            store,
            dedup,
            fetcher,
            ignore_origins,
            dedup_timeout: DEFAULT_DEDUP_TIMEOUT,
        }
    }

    /// Run one intercepted request through the engine.
    pub async fn handle(&self, request: Request<Bytes>) -> Result<Response<Bytes>, PipelineError> {
        let Some(settings) = self
            .policy
            .resolve_request_settings(&request, &self.ignore_origins)
        else {
            return self.bypass(request, "no-policy").await;
        };

        if !settings.cacheable() {
            return self.bypass(request, "no-freshness-settings").await;
        }

        let key = match cache_key(&request, &settings.key_headers) {
            Ok(key) => key,
            Err(err) => {
                warn!(url = %request.uri(), error = %err, "cache key construction failed");
                return self.bypass(request, "unkeyable").await;
            }
        };

        if let Some(entry) = self.store.matching(&key).await {
            match entry.stored_at() {
                Some(stored_at) => match freshness(stored_at, &settings, now_ms()) {
                    Some(Freshness::Fresh) => {
                        debug!(key, outcome = "hit", "serving cached response");
                        counter!(METRIC_REQUESTS, "outcome" => "hit").increment(1);
                        return Ok(entry.into_response());
                    }
                    _ => {
                        debug!(key, outcome = "stale", "evicting stale entry");
                        self.store.delete(&key).await;
                    }
                },
                None => {
                    warn!(key, "entry without parsable timestamp; deleting");
                    self.store.delete(&key).await;
                }
            }
        }

        counter!(METRIC_REQUESTS, "outcome" => "miss").increment(1);
        self.fetch_and_store(request, key).await
    }

    /// Run every prefetch-eligible declared endpoint through the pipeline in
    /// parallel. Individual failures are logged, never propagated.
    pub async fn prefetch(&self, modes: &[PrefetchMode]) {
        let requests = self.policy.prefetch_targets(modes);
        if requests.is_empty() {
            return;
        }

        info!(count = requests.len(), "running prefetch sweep");
        let sweeps = requests.into_iter().map(|request| {
            let url = request.uri().to_string();
            async move {
                if let Err(err) = self.handle(request).await {
                    warn!(url = %url, error = %err, "prefetch request failed");
                }
            }
        });
        futures::future::join_all(sweeps).await;
    }

    async fn bypass(
        &self,
        request: Request<Bytes>,
        reason: &'static str,
    ) -> Result<Response<Bytes>, PipelineError> {
        debug!(url = %request.uri(), reason, "bypassing cache");
        counter!(METRIC_REQUESTS, "outcome" => "bypass").increment(1);
        Ok(self.fetcher.fetch(request).await?)
    }

    async fn fetch_and_store(
        &self,
        request: Request<Bytes>,
        key: String,
    ) -> Result<Response<Bytes>, PipelineError> {
        // Keep a copy for re-resolving the policy at write-back time: a
        // policy swap while the fetch is in flight can turn this request
        // into a bypass, in which case the result must not be stored.
        let probe = clone_request(&request);
        let policy = self.policy.clone();
        let ignore_origins = self.ignore_origins.clone();
        let fetcher = self.fetcher.clone();
        let store = self.store.clone();
        let write_key = key.clone();

        let fetched = self
            .dedup
            .dedupe(
                &key,
                async move {
                    let response = fetcher.fetch(request).await?;
                    let mut cached = CachedResponse::from_response(response);

                    if cached.status().is_success() {
                        let still_covered = policy
                            .resolve_request_settings(&probe, &ignore_origins)
                            .is_some_and(|settings| settings.cacheable());
                        if still_covered {
                            cached.stamp(now_ms());
                            store.put(write_key, cached.clone()).await;
                        } else {
                            debug!(key = %write_key, "policy moved on; discarding write-back");
                        }
                    }

                    Ok(cached)
                },
                self.dedup_timeout,
            )
            .await?;

        Ok(fetched.into_response())
    }
}

fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}
