use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tapedeck_protocol::{Chunk, ChunkTransport, DeliveryError, SessionId, TransportError};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

use crate::retry::RetryPolicy;

/// Successful delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session_id: SessionId,
    pub idx: u64,
    pub attempts: u32,
}

/// Terminal result of one `deliver` call, as seen by monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Delivery),
    Dropped {
        session_id: SessionId,
        idx: u64,
        error: DeliveryError,
    },
}

#[derive(Debug, Default)]
pub struct UploadStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub failed_attempts: u64,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadStatsSnapshot {
        UploadStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Broadcast of delivery outcomes; dropped chunks are never silent.
#[derive(Clone, Debug)]
pub struct DeliveryHub {
    sender: broadcast::Sender<DeliveryOutcome>,
}

impl DeliveryHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, outcome: DeliveryOutcome) {
        let _ = self.sender.send(outcome);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.sender.subscribe()
    }
}

impl Default for DeliveryHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Delivers chunks with at most `max_attempts` tries each.
///
/// Retries and backoff sleep only the calling task. The uploader never
/// re-queues a chunk once its attempts are exhausted.
#[derive(Clone)]
pub struct Uploader {
    transport: Arc<dyn ChunkTransport>,
    policy: RetryPolicy,
    stats: Arc<UploadStats>,
    hub: DeliveryHub,
}

impl Uploader {
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            stats: Arc::new(UploadStats::default()),
            hub: DeliveryHub::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hub(mut self, hub: DeliveryHub) -> Self {
        self.hub = hub;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> UploadStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn hub(&self) -> &DeliveryHub {
        &self.hub
    }

    #[instrument(
        skip(self, chunk),
        fields(session_id = %chunk.session_id, idx = chunk.idx, events = chunk.events.len())
    )]
    pub async fn deliver(&self, chunk: &Chunk, endpoint: &str) -> Result<Delivery, DeliveryError> {
        let mut attempt = 0_u32;
        let last: TransportError = loop {
            attempt += 1;
            match self.transport.send(endpoint, chunk).await {
                Ok(()) => {
                    let delivery = Delivery {
                        session_id: chunk.session_id.clone(),
                        idx: chunk.idx,
                        attempts: attempt,
                    };
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    self.hub.publish(DeliveryOutcome::Delivered(delivery.clone()));
                    debug!(attempts = attempt, "chunk delivered");
                    return Ok(delivery);
                }
                Err(source) => {
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.delay_after_attempt(attempt);
                    let transient = DeliveryError::Transient {
                        attempt,
                        source: source.clone(),
                    };
                    warn!(
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %transient,
                        "chunk delivery attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    if attempt >= self.policy.max_attempts {
                        break source;
                    }
                }
            }
        };

        let error = DeliveryError::Exhausted {
            attempts: attempt,
            last,
        };
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        self.hub.publish(DeliveryOutcome::Dropped {
            session_id: chunk.session_id.clone(),
            idx: chunk.idx,
            error: error.clone(),
        });
        error!(error = %error, "chunk dropped after exhausting delivery attempts");
        Err(error)
    }
}
