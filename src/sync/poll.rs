//! HTTP fallback polling.
//!
//! A one-shot GET against the configured poll URL, decoding the body as a
//! bare `CachePolicy` JSON document. Polling self-suppresses while the
//! stream is connected; the engine drives the cadence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::debug;

use super::{PolicyDelivery, SourceKind, SyncError};

pub struct PollSource {
    url: String,
    client: reqwest::Client,
    delivery: Arc<PolicyDelivery>,
    stream_connected: Arc<AtomicBool>,
}

impl PollSource {
    pub fn new(
        url: String,
        delivery: Arc<PolicyDelivery>,
        stream_connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            delivery,
            stream_connected,
        }
    }

    /// Fetch and offer the latest policy. Skipped while the stream is up; an
    /// unchanged policy is a no-op at the delivery gate.
    pub async fn poll(&self) -> Result<(), SyncError> {
        if self.stream_connected.load(Ordering::SeqCst) {
            debug!(url = %self.url, "stream connected; skipping fallback poll");
            return Ok(());
        }

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| SyncError::Poll(err.to_string()))?;

        let raw: Value = response
            .json()
            .await
            .map_err(|err| SyncError::Poll(err.to_string()))?;

        self.delivery.offer(SourceKind::Poll, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::policy::CachePolicy;
    use crate::sync::SyncHandler;

    struct NoopHandler;

    #[async_trait]
    impl SyncHandler for NoopHandler {
        async fn on_policy(&self, _policy: CachePolicy) {}
        async fn on_connect(&self) {}
        async fn on_disconnect(&self) {}
    }

    #[tokio::test]
    async fn poll_is_skipped_while_stream_connected() {
        let delivery = Arc::new(PolicyDelivery::new(Arc::new(NoopHandler)));
        let connected = Arc::new(AtomicBool::new(true));
        // An unroutable URL: reaching the network would fail loudly.
        let poller = PollSource::new(
            "http://127.0.0.1:1/policy".to_string(),
            delivery,
            connected,
        );

        poller.poll().await.expect("skip is not an error");
    }

    #[tokio::test]
    async fn unreachable_poll_url_is_a_transport_error() {
        let delivery = Arc::new(PolicyDelivery::new(Arc::new(NoopHandler)));
        let connected = Arc::new(AtomicBool::new(false));
        let poller = PollSource::new(
            "http://127.0.0.1:1/policy".to_string(),
            delivery,
            connected,
        );

        assert!(matches!(poller.poll().await, Err(SyncError::Poll(_))));
    }
}
