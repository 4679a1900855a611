//! Policy persistence across engine restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use raffica::config::EngineEnv;
use raffica::engine::{Engine, HostHub, PolicyPersistence};
use raffica::fetch::{FetchError, Fetcher};
use raffica::policy::{CachePolicy, EndpointPolicy, HostPolicy, SettingsPatch};

struct NullFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for NullFetcher {
    async fn fetch(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::new(Bytes::from_static(b"ok"));
        *response.status_mut() = StatusCode::OK;
        Ok(response)
    }
}

fn engine_env() -> EngineEnv {
    EngineEnv {
        cache_name: Some("responses".to_string()),
        websocket_server_url: Some("ws://127.0.0.1:1/sync".to_string()),
        ..Default::default()
    }
}

fn policy_with_config_ttl(config_ttl: u64) -> CachePolicy {
    let endpoint = EndpointPolicy {
        settings: None,
        methods: HashMap::from([(
            "GET".to_string(),
            SettingsPatch {
                ttl: Some(60_000),
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
        config_ttl: Some(config_ttl),
    }
}

async fn fresh_engine(dir: &std::path::Path) -> Engine {
    Engine::new(
        engine_env(),
        HostHub::new(),
        Arc::new(NullFetcher {
            calls: AtomicUsize::new(0),
        }),
        PolicyPersistence::Dir(dir.to_path_buf()),
    )
    .await
}

#[tokio::test]
async fn unexpired_policy_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = fresh_engine(dir.path()).await;
    first
        .policy_store()
        .expect("policy store")
        .set(Some(policy_with_config_ttl(3_600_000)))
        .await;
    first.shutdown();
    drop(first);

    let second = fresh_engine(dir.path()).await;
    second.activate().await;

    let snapshot = second
        .policy_store()
        .expect("policy store")
        .snapshot()
        .expect("persisted policy adopted");
    assert_eq!(snapshot.config_ttl, Some(3_600_000));
    second.shutdown();
}

#[tokio::test]
async fn expired_policy_is_not_observed_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = fresh_engine(dir.path()).await;
    first
        .policy_store()
        .expect("policy store")
        .set(Some(policy_with_config_ttl(40)))
        .await;
    // Shut down before the in-memory expiry fires, leaving only the record.
    first.shutdown();
    drop(first);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = fresh_engine(dir.path()).await;
    second.activate().await;

    assert!(
        second
            .policy_store()
            .expect("policy store")
            .snapshot()
            .is_none(),
        "a policy past its configTTL must not be adopted"
    );
    second.shutdown();
}

#[tokio::test]
async fn reset_clears_the_persisted_record() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = fresh_engine(dir.path()).await;
    let policy = first.policy_store().expect("policy store");
    policy.set(Some(policy_with_config_ttl(3_600_000))).await;
    policy.reset().await;
    first.shutdown();
    drop(first);

    let second = fresh_engine(dir.path()).await;
    second.activate().await;

    assert!(
        second
            .policy_store()
            .expect("policy store")
            .snapshot()
            .is_none()
    );
    second.shutdown();
}
