//! Engine lifecycle and wiring.
//!
//! One [`Engine`] is one worker instance: it owns the policy store, the sync
//! client, its view of the shared response store, and the deduplication
//! layer, threaded together behind a context object rather than module-level
//! state so sibling instances (and tests) can share or isolate the host
//! facilities explicitly.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_POLL_INTERVAL_MS, EngineEnv};
use crate::dedup::{BusHub, DEDUP_BUS, DedupLayer};
use crate::fetch::Fetcher;
use crate::pipeline::{PipelineError, RequestPipeline};
use crate::policy::{CachePolicy, POLICY_DB_FILE, PolicyDb, PolicyObserver, PolicyStore, PrefetchMode};
use crate::store::{ResponseStore, StoreHub};
use crate::sync::{SyncClient, SyncHandler};
use crate::util::{Debouncer, MutexExt};

/// Debounce window for the post-policy-change warm-up sweep.
pub const WARMUP_DEBOUNCE: Duration = Duration::from_millis(500);

static GLOBAL_HOST: Lazy<HostHub> = Lazy::new(HostHub::default);

/// The host facilities sibling instances coordinate through: named response
/// stores and the broadcast bus. Cloning shares the underlying registries.
#[derive(Clone, Default)]
pub struct HostHub {
    pub stores: StoreHub,
    pub bus: BusHub,
}

impl HostHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide hub. Instances built on it behave like sibling
    /// workers on one host.
    pub fn global() -> Self {
        GLOBAL_HOST.clone()
    }
}

/// Where the durable policy record lives.
pub enum PolicyPersistence {
    Disabled,
    InMemory,
    /// Directory holding the policy database file.
    Dir(PathBuf),
}

struct EngineCore {
    env: EngineEnv,
    policy: Arc<PolicyStore>,
    store: ResponseStore,
    dedup: Arc<DedupLayer>,
    pipeline: Arc<RequestPipeline>,
    sync: Arc<SyncClient>,
    warmup: Arc<Debouncer>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// A single engine instance.
pub struct Engine {
    fetcher: Arc<dyn Fetcher>,
    core: Option<EngineCore>,
}

impl Engine {
    /// Install the engine (the worker `install` phase): validate the
    /// environment and build the subsystems. An environment missing
    /// `cacheName` or `websocketServerUrl` yields a bypass-only engine.
    pub async fn new(
        env: EngineEnv,
        host: HostHub,
        fetcher: Arc<dyn Fetcher>,
        persistence: PolicyPersistence,
    ) -> Self {
        let (Some(cache_name), Some(stream_url)) =
            (env.cache_name.clone(), env.websocket_server_url.clone())
        else {
            warn!("engine environment incomplete; running in no-op bypass mode");
            return Self { fetcher, core: None };
        };

        let db = open_policy_db(persistence).await;
        let policy = PolicyStore::new(db);
        let store = host.stores.open(&cache_name);
        let dedup = DedupLayer::new(host.bus.open(DEDUP_BUS));
        let pipeline = Arc::new(RequestPipeline::new(
            policy.clone(),
            store.clone(),
            dedup.clone(),
            fetcher.clone(),
            env.ignore_origins.clone(),
        ));
        let warmup = Arc::new(Debouncer::new(WARMUP_DEBOUNCE));

        let hooks = Arc::new(EngineHooks {
            policy: policy.clone(),
            store: store.clone(),
            pipeline: pipeline.clone(),
            warmup: warmup.clone(),
        });
        policy.subscribe(hooks.clone());

        let sync = Arc::new(SyncClient::new(
            stream_url,
            env.fallback_polling_server_url.clone(),
            hooks,
        ));

        info!(cache = %cache_name, owner_id = %dedup.owner_id(), "engine installed");
        Self {
            fetcher,
            core: Some(EngineCore {
                env,
                policy,
                store,
                dedup,
                pipeline,
                sync,
                warmup,
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Activate the engine (the worker `activate` phase): adopt a still-valid
    /// persisted policy, run the on-load prefetch sweep, and establish sync.
    pub async fn activate(&self) {
        let Some(core) = &self.core else {
            return;
        };

        core.policy.load_from_persistence_if_valid().await;
        core.pipeline
            .prefetch(&[PrefetchMode::OnLoad, PrefetchMode::Always])
            .await;

        core.sync.connect();
        self.spawn_poll_loop(core);
    }

    /// Run one intercepted request (the worker `fetch` phase).
    pub async fn handle(&self, request: Request<Bytes>) -> Result<Response<Bytes>, PipelineError> {
        match &self.core {
            Some(core) => core.pipeline.handle(request).await,
            None => Ok(self.fetcher.fetch(request).await?),
        }
    }

    /// Tear the instance down (the worker `deactivate` phase): stop timers
    /// and sync, dispose deduplication and heartbeat state.
    pub fn shutdown(&self) {
        let Some(core) = &self.core else {
            return;
        };

        if let Some(task) = core.poll_task.lock_or_recover("engine.shutdown").take() {
            task.abort();
        }
        core.sync.shutdown();
        core.warmup.cancel();
        core.policy.shutdown();
        core.dedup.dispose();
        info!("engine shut down");
    }

    pub fn is_bypass(&self) -> bool {
        self.core.is_none()
    }

    pub fn is_sync_connected(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.sync.is_connected())
    }

    /// The engine's policy store, when not in bypass mode.
    pub fn policy_store(&self) -> Option<Arc<PolicyStore>> {
        self.core.as_ref().map(|core| core.policy.clone())
    }

    /// The engine's response store handle, when not in bypass mode.
    pub fn response_store(&self) -> Option<ResponseStore> {
        self.core.as_ref().map(|core| core.store.clone())
    }

    fn spawn_poll_loop(&self, core: &EngineCore) {
        if core.env.fallback_polling_server_url.is_none() {
            return;
        }

        let interval_ms = core
            .env
            .fallback_polling_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let sync = core.sync.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.tick().await; // Skip the immediate first tick.
            loop {
                ticker.tick().await;
                sync.poll().await;
            }
        });

        if let Some(previous) = core
            .poll_task
            .lock_or_recover("engine.spawn_poll_loop")
            .replace(task)
        {
            previous.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Glue between the sync client, the policy store, and the pipeline.
struct EngineHooks {
    policy: Arc<PolicyStore>,
    store: ResponseStore,
    pipeline: Arc<RequestPipeline>,
    warmup: Arc<Debouncer>,
}

impl EngineHooks {
    /// Debounced warm-up of update-eligible prefetch targets. Repeated
    /// triggers inside the window coalesce to one trailing sweep.
    fn schedule_warmup(&self) {
        let pipeline = self.pipeline.clone();
        self.warmup.trigger(async move {
            pipeline
                .prefetch(&[PrefetchMode::OnUpdate, PrefetchMode::Always])
                .await;
        });
    }
}

#[async_trait]
impl SyncHandler for EngineHooks {
    async fn on_policy(&self, policy: CachePolicy) {
        self.policy.set(Some(policy)).await;
    }

    async fn on_connect(&self) {
        debug!("policy stream connected; scheduling prefetch sweep");
        self.schedule_warmup();
    }

    async fn on_disconnect(&self) {
        debug!("policy stream disconnected; fallback polling takes over");
    }
}

#[async_trait]
impl PolicyObserver for EngineHooks {
    async fn on_set(&self, _policy: Arc<CachePolicy>) {
        // The sweep runs to completion before warm-up is even scheduled, so
        // a warmed entry can never be re-judged against the old policy.
        self.store.delete_stale_entries(&self.policy).await;
        self.schedule_warmup();
    }

    async fn on_reset(&self) {
        self.store.clear().await;
    }
}

async fn open_policy_db(persistence: PolicyPersistence) -> Option<PolicyDb> {
    let result = match persistence {
        PolicyPersistence::Disabled => return None,
        PolicyPersistence::InMemory => PolicyDb::open_in_memory().await,
        PolicyPersistence::Dir(dir) => PolicyDb::open(dir.join(POLICY_DB_FILE)).await,
    };

    match result {
        Ok(db) => Some(db),
        Err(err) => {
            warn!(error = %err, "policy database unavailable; persistence disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::{HeaderValue, Method, StatusCode};

    use super::*;
    use crate::fetch::FetchError;
    use crate::policy::{EndpointPolicy, HostPolicy, SettingsPatch};

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = Response::new(Bytes::from_static(b"upstream"));
            *response.status_mut() = StatusCode::OK;
            response
                .headers_mut()
                .insert("content-type", HeaderValue::from_static("text/plain"));
            Ok(response)
        }
    }

    fn operational_env() -> EngineEnv {
        EngineEnv {
            cache_name: Some("responses".to_string()),
            // Nothing listens here; the stream driver just backs off.
            websocket_server_url: Some("ws://127.0.0.1:1/sync".to_string()),
            ..Default::default()
        }
    }

    fn users_policy(prefetch: PrefetchMode) -> CachePolicy {
        let endpoint = EndpointPolicy {
            settings: None,
            methods: HashMap::from([(
                "GET".to_string(),
                SettingsPatch {
                    ttl: Some(60_000),
                    prefetch: Some(prefetch),
                    ..Default::default()
                },
            )]),
        };
        let host = HostPolicy {
            settings: None,
            endpoints: HashMap::from([("users".to_string(), endpoint)]),
        };
        CachePolicy {
            settings: None,
            hosts: HashMap::from([("https://api.example.com".to_string(), host)]),
            config_ttl: None,
        }
    }

    fn get_users() -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri("https://api.example.com/users")
            .body(Bytes::new())
            .expect("request")
    }

    #[tokio::test]
    async fn incomplete_env_yields_bypass_engine() {
        let fetcher = CountingFetcher::new();
        let engine = Engine::new(
            EngineEnv::default(),
            HostHub::new(),
            fetcher.clone(),
            PolicyPersistence::Disabled,
        )
        .await;

        assert!(engine.is_bypass());
        let response = engine.handle(get_users()).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn operational_engine_caches_through_the_pipeline() {
        let fetcher = CountingFetcher::new();
        let engine = Engine::new(
            operational_env(),
            HostHub::new(),
            fetcher.clone(),
            PolicyPersistence::Disabled,
        )
        .await;

        engine
            .policy_store()
            .expect("policy store")
            .set(Some(users_policy(PrefetchMode::Never)))
            .await;

        engine.handle(get_users()).await.expect("first");
        engine.handle(get_users()).await.expect("second");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn policy_set_warms_update_targets_after_the_debounce() {
        let fetcher = CountingFetcher::new();
        let engine = Engine::new(
            operational_env(),
            HostHub::new(),
            fetcher.clone(),
            PolicyPersistence::Disabled,
        )
        .await;

        engine
            .policy_store()
            .expect("policy store")
            .set(Some(users_policy(PrefetchMode::OnUpdate)))
            .await;

        // Inside the debounce window nothing has been warmed yet.
        assert_eq!(fetcher.calls(), 0);

        tokio::time::sleep(WARMUP_DEBOUNCE + Duration::from_millis(200)).await;
        assert_eq!(fetcher.calls(), 1);

        let store = engine.response_store().expect("store");
        assert_eq!(store.len().await, 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn policy_reset_clears_the_response_store() {
        let fetcher = CountingFetcher::new();
        let engine = Engine::new(
            operational_env(),
            HostHub::new(),
            fetcher.clone(),
            PolicyPersistence::Disabled,
        )
        .await;
        let policy = engine.policy_store().expect("policy store");
        let store = engine.response_store().expect("store");

        policy.set(Some(users_policy(PrefetchMode::Never))).await;
        engine.handle(get_users()).await.expect("response");
        assert_eq!(store.len().await, 1);

        policy.reset().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = Engine::new(
            operational_env(),
            HostHub::new(),
            CountingFetcher::new(),
            PolicyPersistence::Disabled,
        )
        .await;

        engine.shutdown();
        engine.shutdown();
    }
}
