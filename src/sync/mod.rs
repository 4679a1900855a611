//! Live policy synchronization.
//!
//! Two transports share one contract: deliver a [`CachePolicy`] by value when
//! it changes. The stream client ([`stream::StreamSource`]) holds a WebSocket
//! subscription with reconnect backoff; the HTTP poller
//! ([`poll::PollSource`]) is the fallback while the stream is down. Both feed
//! decoded values through the [`PolicyDelivery`] gate, which collapses
//! re-sends of structurally identical policies before notifying the handler.

pub mod poll;
pub mod stream;

pub use poll::PollSource;
pub use stream::StreamSource;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::policy::CachePolicy;
use crate::util::MutexExt;

/// The only recognized stream message type.
pub const MESSAGE_TYPE_CACHE_CONFIG: &str = "CACHE_CONFIG";

/// First reconnect delay after a stream drop.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Reconnect delay ceiling.
pub const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed sync message: {0}")]
    Malformed(String),
    #[error("policy stream failed: {0}")]
    Stream(String),
    #[error("policy poll failed: {0}")]
    Poll(String),
}

/// Engine-side callbacks of the sync client.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn on_policy(&self, policy: CachePolicy);
    async fn on_connect(&self);
    async fn on_disconnect(&self);
}

/// Which transport produced a delivery. Log/metric label only; both sources
/// behave identically past the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Stream,
    Poll,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Stream => "stream",
            SourceKind::Poll => "poll",
        }
    }
}

/// Change-detection gate in front of the handler.
///
/// Policies are compared in canonical form (JSON value equality, object keys
/// unordered) so heartbeat-style re-sends of the same policy do not re-notify
/// the policy store.
pub struct PolicyDelivery {
    handler: Arc<dyn SyncHandler>,
    last_delivered: Mutex<Option<Value>>,
}

impl PolicyDelivery {
    pub fn new(handler: Arc<dyn SyncHandler>) -> Self {
        Self {
            handler,
            last_delivered: Mutex::new(None),
        }
    }

    /// Offer a raw policy value from a transport. Returns whether the value
    /// was actually delivered.
    ///
    /// A value equal to the last delivered one is a no-op; a value that does
    /// not decode into a structurally valid policy is rejected without
    /// touching the change-detection state.
    pub async fn offer(&self, source: SourceKind, raw: Value) -> Result<bool, SyncError> {
        {
            let last = self.last_delivered.lock_or_recover("sync.offer");
            if last.as_ref() == Some(&raw) {
                debug!(source = source.as_str(), "policy unchanged; skipping delivery");
                return Ok(false);
            }
        }

        let policy: CachePolicy = serde_json::from_value(raw.clone())
            .map_err(|err| SyncError::Malformed(format!("policy payload: {err}")))?;

        *self.last_delivered.lock_or_recover("sync.offer") = Some(raw);

        info!(
            source = source.as_str(),
            hosts = policy.hosts.len(),
            "delivering changed policy"
        );
        self.handler.on_policy(policy).await;
        Ok(true)
    }
}

/// A decoded stream envelope.
#[derive(Debug)]
pub(crate) enum Envelope {
    CacheConfig(Value),
    Unknown(String),
}

/// Decode a `{ "type": ..., "data": ... }` stream message.
pub(crate) fn parse_envelope(text: &str) -> Result<Envelope, SyncError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| SyncError::Malformed(err.to_string()))?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Malformed("envelope without a `type` field".to_string()))?;

    if message_type == MESSAGE_TYPE_CACHE_CONFIG {
        Ok(Envelope::CacheConfig(
            value.get("data").cloned().unwrap_or(Value::Null),
        ))
    } else {
        Ok(Envelope::Unknown(message_type.to_string()))
    }
}

/// Double the reconnect delay, capped at [`MAX_BACKOFF_MS`].
pub(crate) fn next_backoff(current_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(MAX_BACKOFF_MS)
}

/// Facade wiring the stream transport and the optional poll fallback.
pub struct SyncClient {
    stream: Arc<StreamSource>,
    poller: Option<PollSource>,
}

impl SyncClient {
    pub fn new(
        stream_url: String,
        poll_url: Option<String>,
        handler: Arc<dyn SyncHandler>,
    ) -> Self {
        let delivery = Arc::new(PolicyDelivery::new(handler.clone()));
        let stream = StreamSource::new(stream_url, handler, delivery.clone());
        let poller = poll_url.map(|url| PollSource::new(url, delivery, stream.connected_flag()));
        Self { stream, poller }
    }

    /// Establish (or re-establish) the stream subscription. Idempotent.
    pub fn connect(&self) {
        self.stream.connect();
    }

    /// One fallback poll. A no-op while the stream is connected or when no
    /// poll URL is configured.
    pub async fn poll(&self) {
        let Some(poller) = &self.poller else {
            debug!("no fallback poll url configured");
            return;
        };
        if let Err(err) = poller.poll().await {
            warn!(error = %err, "fallback poll failed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    pub fn shutdown(&self) {
        self.stream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::policy::{EndpointPolicy, HostPolicy, SettingsPatch};

    #[derive(Default)]
    struct RecordingHandler {
        policies: AtomicUsize,
    }

    #[async_trait]
    impl SyncHandler for RecordingHandler {
        async fn on_policy(&self, _policy: CachePolicy) {
            self.policies.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_connect(&self) {}

        async fn on_disconnect(&self) {}
    }

    fn policy_value(ttl: u64) -> Value {
        let endpoint = EndpointPolicy {
            settings: None,
            methods: HashMap::from([(
                "GET".to_string(),
                SettingsPatch {
                    ttl: Some(ttl),
                    ..Default::default()
                },
            )]),
        };
        let host = HostPolicy {
            settings: None,
            endpoints: HashMap::from([("users".to_string(), endpoint)]),
        };
        let policy = CachePolicy {
            settings: None,
            hosts: HashMap::from([("https://api.example.com".to_string(), host)]),
            config_ttl: None,
        };
        serde_json::to_value(policy).expect("policy serializes")
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut delays = Vec::new();
        let mut backoff = INITIAL_BACKOFF_MS;
        for _ in 0..7 {
            delays.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn envelope_parses_cache_config() {
        let text = format!(
            r#"{{"type":"CACHE_CONFIG","data":{}}}"#,
            policy_value(1_000)
        );
        match parse_envelope(&text).expect("envelope") {
            Envelope::CacheConfig(data) => assert!(data.get("hosts").is_some()),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn envelope_reports_unknown_types() {
        let envelope = parse_envelope(r#"{"type":"PING"}"#).expect("envelope");
        assert!(matches!(envelope, Envelope::Unknown(kind) if kind == "PING"));
    }

    #[test]
    fn envelope_rejects_invalid_json_and_missing_type() {
        assert!(parse_envelope("not json {").is_err());
        assert!(parse_envelope(r#"{"data":{}}"#).is_err());
    }

    #[tokio::test]
    async fn identical_policies_collapse_to_one_delivery() {
        let handler = Arc::new(RecordingHandler::default());
        let delivery = PolicyDelivery::new(handler.clone());

        let delivered = delivery
            .offer(SourceKind::Stream, policy_value(1_000))
            .await
            .expect("first offer");
        assert!(delivered);

        let delivered = delivery
            .offer(SourceKind::Stream, policy_value(1_000))
            .await
            .expect("second offer");
        assert!(!delivered);

        assert_eq!(handler.policies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_policy_is_delivered_again() {
        let handler = Arc::new(RecordingHandler::default());
        let delivery = PolicyDelivery::new(handler.clone());

        delivery
            .offer(SourceKind::Stream, policy_value(1_000))
            .await
            .expect("first offer");
        delivery
            .offer(SourceKind::Poll, policy_value(2_000))
            .await
            .expect("second offer");

        assert_eq!(handler.policies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn structurally_invalid_policy_is_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let delivery = PolicyDelivery::new(handler.clone());

        let result = delivery
            .offer(SourceKind::Stream, serde_json::json!({ "not": "a policy" }))
            .await;
        assert!(result.is_err());
        assert_eq!(handler.policies.load(Ordering::SeqCst), 0);

        // The rejected value must not poison change detection.
        let delivered = delivery
            .offer(SourceKind::Stream, policy_value(1_000))
            .await
            .expect("valid offer");
        assert!(delivered);
    }
}
