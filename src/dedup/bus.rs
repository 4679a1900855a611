//! Broadcast bus between sibling instances.
//!
//! A named many-to-many channel modeled on the platform broadcast primitive:
//! FIFO per sender, no cross-sender ordering, and no delivery back to the
//! sender. Messages carry the coordination traffic of the deduplication
//! layer; the serialized shapes below are the bus wire schema.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::CachedResponse;

/// Channel name shared by all engine instances.
pub const DEDUP_BUS: &str = "api-cache-dedup";

const BUS_CAPACITY: usize = 256;

/// A response serialized for bus transfer: `{ body, status, statusText,
/// headers }` with the body base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub body: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

impl WireResponse {
    pub fn from_cached(cached: &CachedResponse) -> Self {
        let status = cached.status();
        Self {
            body: BASE64.encode(cached.body()),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: cached
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect(),
        }
    }

    /// Rebuild a fresh response from the envelope. `None` when the status or
    /// body is undecodable; individually invalid headers are skipped.
    pub fn into_cached(self) -> Option<CachedResponse> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let body = Bytes::from(BASE64.decode(self.body).ok()?);

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        Some(CachedResponse::new(status, &headers, body))
    }
}

/// Bus message payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusPayload {
    #[serde(rename_all = "camelCase")]
    TaskHeartbeat {
        key: String,
        owner_id: Uuid,
        timestamp: u64,
    },
    TaskEnd { key: String },
    ResponseReady { key: String, response: WireResponse },
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub sender: Uuid,
    pub payload: BusPayload,
}

/// One named channel handle.
#[derive(Clone)]
pub struct MessageBus {
    name: String,
    tx: broadcast::Sender<BusMessage>,
}

impl MessageBus {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Post a message. Delivery to peers is asynchronous and best-effort; a
    /// bus with no listeners swallows the message.
    pub fn publish(&self, sender: Uuid, payload: BusPayload) {
        let _ = self.tx.send(BusMessage { sender, payload });
    }
}

/// Registry of named broadcast channels shared by instances on one host.
#[derive(Clone, Default)]
pub struct BusHub {
    channels: Arc<DashMap<String, broadcast::Sender<BusMessage>>>,
}

impl BusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> MessageBus {
        let tx = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone();
        MessageBus {
            name: name.to_string(),
            tx,
        }
    }
}
