//! Response cache manager.
//!
//! A thin ownership layer over a named blob store holding cache-key /
//! response pairs. Every stored entry carries the engine-managed
//! `x-cache-timestamp` header; entries without a parsable timestamp are
//! treated as corrupt and deleted on sight.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::pipeline::key::revert_key;
use crate::policy::{Freshness, PolicyStore, freshness};
use crate::util::now_ms;

/// Engine-reserved header carrying the entry insertion time in epoch ms.
pub const TIMESTAMP_HEADER: &str = "x-cache-timestamp";

/// A stored response: status, headers, and a fully buffered body.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut stored_headers = Vec::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            stored_headers.push((name.clone(), value.clone()));
        }

        Self {
            status,
            headers: stored_headers,
            body,
        }
    }

    pub fn from_response(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self::new(parts.status, &parts.headers, body)
    }

    pub fn into_response(self) -> Response<Bytes> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            headers.append(name, value);
        }

        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.as_str().eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.to_str().ok())
    }

    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    /// Set (or replace) the insertion timestamp.
    pub fn stamp(&mut self, stored_at: u64) {
        self.headers
            .retain(|(name, _)| name.as_str() != TIMESTAMP_HEADER);
        let value = HeaderValue::from_str(&stored_at.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0"));
        self.headers
            .push((HeaderName::from_static(TIMESTAMP_HEADER), value));
    }

    /// Insertion time in epoch ms, or `None` when the header is absent or
    /// unparsable (the entry is then corrupt per the storage invariant).
    pub fn stored_at(&self) -> Option<u64> {
        self.header(TIMESTAMP_HEADER)?.parse().ok()
    }
}

/// One named response store shared by every instance on the host.
#[derive(Clone)]
pub struct ResponseStore {
    name: String,
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
}

impl ResponseStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn put(&self, key: String, response: CachedResponse) {
        self.entries.write().await.insert(key, response);
    }

    pub async fn matching(&self, key: &str) -> Option<CachedResponse> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Enumerate all stored keys and delete each.
    pub async fn clear(&self) {
        let keys = self.keys().await;
        let count = keys.len();
        for key in keys {
            self.delete(&key).await;
        }
        info!(store = %self.name, deleted = count, "response store cleared");
    }

    /// Delete every entry that is stale (or no longer resolvable) under the
    /// currently active policy.
    ///
    /// Best-effort: entries that disappear mid-sweep are skipped, and an
    /// entry whose timestamp header cannot be parsed is deleted as corrupt.
    pub async fn delete_stale_entries(&self, policy: &PolicyStore) {
        let now = now_ms();
        let mut deleted = 0usize;

        for key in self.keys().await {
            let Some(entry) = self.matching(&key).await else {
                continue;
            };

            if self.is_stale_under(&key, &entry, policy, now) {
                if self.delete(&key).await {
                    deleted += 1;
                }
            }
        }

        info!(store = %self.name, deleted, "stale sweep complete");
    }

    fn is_stale_under(
        &self,
        key: &str,
        entry: &CachedResponse,
        policy: &PolicyStore,
        now: u64,
    ) -> bool {
        let Some(stored_at) = entry.stored_at() else {
            warn!(store = %self.name, key, "entry without parsable timestamp; deleting");
            return true;
        };

        let Ok(reverted) = revert_key(key) else {
            warn!(store = %self.name, key, "entry key is not revertible; deleting");
            return true;
        };

        let request = http::Request::builder()
            .method(reverted.method.as_str())
            .uri(reverted.url)
            .body(Bytes::new());
        let Ok(request) = request else {
            return true;
        };

        match resolve_for_sweep(policy, &request) {
            Some(settings) => match freshness(stored_at, &settings, now) {
                Some(Freshness::Fresh) => false,
                // Stale, or freshness no longer establishable under the new
                // policy: either way the entry can never be served again.
                _ => true,
            },
            None => {
                debug!(store = %self.name, key, "entry no longer covered by policy");
                true
            }
        }
    }
}

fn resolve_for_sweep(
    policy: &PolicyStore,
    request: &Request<Bytes>,
) -> Option<crate::policy::CacheSettings> {
    policy.resolve_request_settings(request, &[])
}

/// Registry of named response stores.
///
/// Sibling instances that open the same store name share contents, modeling
/// the platform-level blob store. Cloning the hub shares the registry.
#[derive(Clone, Default)]
pub struct StoreHub {
    stores: Arc<DashMap<String, ResponseStore>>,
}

impl StoreHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (creating if needed) the named store.
    pub fn open(&self, name: &str) -> ResponseStore {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| ResponseStore::new(name))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;
    use crate::pipeline::key::cache_key;
    use crate::policy::{
        CachePolicy, EndpointPolicy, HostPolicy, PolicyStore, SettingsPatch,
    };
    use http::Method;

    fn response_with_timestamp(stored_at: Option<&str>) -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        if let Some(value) = stored_at {
            headers.insert(
                TIMESTAMP_HEADER,
                HeaderValue::from_str(value).expect("header value"),
            );
        }
        CachedResponse::new(StatusCode::OK, &headers, Bytes::from_static(b"body"))
    }

    fn users_policy(ttl: Option<u64>, last_modified: Option<u64>) -> CachePolicy {
        let endpoint = EndpointPolicy {
            settings: None,
            methods: StdHashMap::from([(
                "GET".to_string(),
                SettingsPatch {
                    ttl,
                    last_modified,
                    ..Default::default()
                },
            )]),
        };
        let host = HostPolicy {
            settings: None,
            endpoints: StdHashMap::from([("users".to_string(), endpoint)]),
        };
        CachePolicy {
            settings: None,
            hosts: StdHashMap::from([("https://api.example.com".to_string(), host)]),
            config_ttl: None,
        }
    }

    fn users_key() -> String {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri("https://api.example.com/users")
            .body(Bytes::new())
            .expect("request");
        cache_key(&request, &[]).expect("key")
    }

    #[tokio::test]
    async fn put_match_delete_round_trip() {
        let store = StoreHub::new().open("responses");

        assert!(store.matching("k").await.is_none());

        store.put("k".to_string(), response_with_timestamp(Some("1"))).await;
        let entry = store.matching("k").await.expect("entry present");
        assert_eq!(entry.status(), StatusCode::OK);
        assert_eq!(entry.stored_at(), Some(1));

        assert!(store.delete("k").await);
        assert!(store.matching("k").await.is_none());
    }

    #[tokio::test]
    async fn hub_shares_stores_by_name() {
        let hub = StoreHub::new();
        let a = hub.open("shared");
        let b = hub.open("shared");

        a.put("k".to_string(), response_with_timestamp(Some("1"))).await;
        assert!(b.matching("k").await.is_some());

        let other = hub.open("isolated");
        assert!(other.matching("k").await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_every_entry() {
        let store = StoreHub::new().open("responses");
        store.put("a".to_string(), response_with_timestamp(Some("1"))).await;
        store.put("b".to_string(), response_with_timestamp(Some("2"))).await;

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn stamp_replaces_existing_timestamp() {
        let mut entry = response_with_timestamp(Some("1"));
        entry.stamp(99);
        assert_eq!(entry.stored_at(), Some(99));
        assert_eq!(
            entry
                .headers()
                .iter()
                .filter(|(name, _)| name.as_str() == TIMESTAMP_HEADER)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn sweep_deletes_corrupt_and_stale_keeps_fresh() {
        let store = StoreHub::new().open("responses");
        let policy = PolicyStore::new(None);
        policy
            .set(Some(users_policy(None, Some(2_000))))
            .await;

        let key = users_key();
        // Fresh: stored at the modification boundary.
        store.put(key.clone(), response_with_timestamp(Some("2000"))).await;
        // Corrupt: unparsable timestamp.
        store
            .put("https://api.example.com/other?__body=none&__method=GET".to_string(),
                response_with_timestamp(Some("not-a-number")))
            .await;

        store.delete_stale_entries(&policy).await;

        assert_eq!(store.len().await, 1);
        assert!(store.matching(&key).await.is_some());

        // Now the server moves lastModified forward: the entry goes stale.
        policy
            .set(Some(users_policy(None, Some(3_000))))
            .await;
        store.delete_stale_entries(&policy).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_deletes_entries_not_covered_by_policy() {
        let store = StoreHub::new().open("responses");
        let policy = PolicyStore::new(None);
        policy.set(Some(users_policy(Some(60_000), None))).await;

        store
            .put(
                "https://elsewhere.example/things?__body=none&__method=GET".to_string(),
                response_with_timestamp(Some("1")),
            )
            .await;

        store.delete_stale_entries(&policy).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cached_response_rebuilds_http_response() {
        let entry = response_with_timestamp(Some("5"));
        let response = entry.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(TIMESTAMP_HEADER)
                .and_then(|value| value.to_str().ok()),
            Some("5")
        );
        assert_eq!(response.body().as_ref(), b"body");
    }
}
