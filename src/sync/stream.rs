//! WebSocket policy stream.
//!
//! Holds the single live subscription to the policy server. The driver task
//! cycles through connect -> read-until-error -> backoff, resetting the
//! backoff to its initial value on every successful open and doubling it on
//! every failure up to the cap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::util::MutexExt;

use super::{
    Envelope, INITIAL_BACKOFF_MS, PolicyDelivery, SourceKind, SyncError, SyncHandler,
    next_backoff, parse_envelope,
};

const METRIC_STREAM_OPENS: &str = "raffica_policy_stream_opens_total";

pub struct StreamSource {
    weak: Weak<StreamSource>,
    url: String,
    handler: Arc<dyn SyncHandler>,
    delivery: Arc<PolicyDelivery>,
    connected: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSource {
    pub fn new(
        url: String,
        handler: Arc<dyn SyncHandler>,
        delivery: Arc<PolicyDelivery>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            url,
            handler,
            delivery,
            connected: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        })
    }

    /// Start the driver task. Idempotent: a live driver is left untouched.
    pub fn connect(&self) {
        let mut driver = self.driver.lock_or_recover("stream.connect");
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(url = %self.url, "policy stream already connecting or open");
            return;
        }

        let Some(this) = self.weak.upgrade() else {
            return;
        };
        *driver = Some(tokio::spawn(this.run()));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shared connection flag, consulted by the poll fallback.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Stop the driver and mark the stream disconnected.
    pub fn shutdown(&self) {
        if let Some(driver) = self.driver.lock_or_recover("stream.shutdown").take() {
            driver.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((mut socket, _)) => {
                    backoff_ms = INITIAL_BACKOFF_MS;
                    self.connected.store(true, Ordering::SeqCst);
                    counter!(METRIC_STREAM_OPENS).increment(1);
                    info!(url = %self.url, "policy stream open");
                    self.handler.on_connect().await;

                    while let Some(frame) = socket.next().await {
                        match frame {
                            Ok(message) => {
                                if let Err(err) = self.handle_message(message).await {
                                    warn!(error = %err, "policy stream message error");
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "policy stream receive failed");
                                break;
                            }
                        }
                    }

                    self.connected.store(false, Ordering::SeqCst);
                    info!(url = %self.url, "policy stream closed");
                    self.handler.on_disconnect().await;
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "policy stream connect failed");
                    self.handler.on_disconnect().await;
                }
            }

            debug!(backoff_ms, "policy stream reconnect scheduled");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = next_backoff(backoff_ms);
        }
    }

    /// Process one frame. An `Err` tears the connection down and enters the
    /// backoff path; recognized-but-unwanted content is dropped silently.
    async fn handle_message(&self, message: Message) -> Result<(), SyncError> {
        match message {
            Message::Text(text) => match parse_envelope(text.as_str())? {
                Envelope::CacheConfig(raw) => {
                    // A structurally invalid policy only drops the message;
                    // the subscription itself is fine.
                    if let Err(err) = self.delivery.offer(SourceKind::Stream, raw).await {
                        warn!(error = %err, "dropping undecodable policy delivery");
                    }
                    Ok(())
                }
                Envelope::Unknown(kind) => {
                    debug!(message_type = %kind, "ignoring unknown stream message type");
                    Ok(())
                }
            },
            Message::Close(_) => Err(SyncError::Stream("server closed the stream".to_string())),
            // Ping/pong are handled by the transport; binary frames are not
            // part of the protocol.
            _ => Ok(()),
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock_or_recover("stream.drop").take() {
            driver.abort();
        }
    }
}
