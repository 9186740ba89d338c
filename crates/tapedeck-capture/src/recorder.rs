//! Capture session lifecycle: start, signal handlers, periodic flush, stop.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tapedeck_protocol::{
    CaptureError, Chunk, ChunkCursor, ChunkTransport, ClickTarget, EventKind, FingerprintProducer,
    KeyframeSource, MutationOp, SerializationError, SessionEvent, SessionId, SessionRegistry,
};
use tapedeck_transport::{
    DeliveryHub, DeliveryOutcome, HttpTransport, RetryPolicy, UploadStatsSnapshot, Uploader,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::chunker::Chunker;
use crate::clock::SessionClock;
use crate::config::CaptureConfig;
use crate::registry::InMemorySessionRegistry;
use crate::sampler::Sampler;

/// Builder for [`Recorder`].
pub struct RecorderBuilder {
    config: CaptureConfig,
    keyframes: Arc<dyn KeyframeSource>,
    fingerprints: Arc<dyn FingerprintProducer>,
    registry: Option<Arc<dyn SessionRegistry>>,
    transport: Option<Arc<dyn ChunkTransport>>,
    retry: RetryPolicy,
    hub: Option<DeliveryHub>,
}

impl RecorderBuilder {
    pub fn new(
        config: CaptureConfig,
        keyframes: Arc<dyn KeyframeSource>,
        fingerprints: Arc<dyn FingerprintProducer>,
    ) -> Self {
        Self {
            config,
            keyframes,
            fingerprints,
            registry: None,
            transport: None,
            retry: RetryPolicy::default(),
            hub: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn delivery_hub(mut self, hub: DeliveryHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Fails only when no transport was supplied and the default HTTP
    /// client cannot be constructed.
    pub fn build(self) -> Result<Recorder, CaptureError> {
        let transport: Arc<dyn ChunkTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let mut uploader = Uploader::new(transport).with_policy(self.retry);
        if let Some(hub) = self.hub {
            uploader = uploader.with_hub(hub);
        }
        Ok(Recorder {
            config: self.config,
            keyframes: self.keyframes,
            fingerprints: self.fingerprints,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(InMemorySessionRegistry::default())),
            uploader,
        })
    }
}

/// Entry point of the capture side. One recorder can start any number of
/// sequential capture sessions against the same registry.
pub struct Recorder {
    config: CaptureConfig,
    keyframes: Arc<dyn KeyframeSource>,
    fingerprints: Arc<dyn FingerprintProducer>,
    registry: Arc<dyn SessionRegistry>,
    uploader: Uploader,
}

impl Recorder {
    pub fn builder(
        config: CaptureConfig,
        keyframes: Arc<dyn KeyframeSource>,
        fingerprints: Arc<dyn FingerprintProducer>,
    ) -> RecorderBuilder {
        RecorderBuilder::new(config, keyframes, fingerprints)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    /// Acquire a session identity, capture the keyframe, emit the opening
    /// chunk and start the flush timer.
    ///
    /// Fails with [`CaptureError::Init`] when the environment cannot produce
    /// a fingerprint or keyframe; nothing is emitted in that case.
    #[instrument(skip(self), fields(project_key = %self.config.project_key))]
    pub async fn start(&self) -> Result<CaptureSession, CaptureError> {
        let session = self
            .registry
            .get_or_create(&self.config.project_key, self.config.user_id.as_ref());

        let fingerprint = self
            .fingerprints
            .compute_fingerprint()
            .await
            .inspect_err(|err| {
                error!(session_id = %session.session_id, error = %err, "fingerprint failed");
            })?;
        let keyframe = self
            .keyframes
            .capture_keyframe()
            .await
            .inspect_err(|err| {
                error!(session_id = %session.session_id, error = %err, "keyframe capture failed");
            })?;

        let resumed = !session.cursor.is_fresh();
        let offset_ms = if resumed {
            session
                .elapsed_ms(Utc::now())
                .max(session.cursor.last_end_ts)
        } else {
            0
        };
        let clock = SessionClock::starting_at(offset_ms);
        let first_idx = session.cursor.next_idx;

        let mut chunker = Chunker::new(&session, fingerprint, offset_ms);
        let opening = chunker.begin(keyframe, clock.now_ms())?;
        self.registry
            .advance_cursor(&session.session_id, chunker.cursor().clone());

        let inner = Arc::new(CaptureInner {
            session_id: session.session_id.clone(),
            endpoint: self.config.endpoint.clone(),
            registry: self.registry.clone(),
            uploader: self.uploader.clone(),
            runtime: Handle::current(),
            clock,
            first_idx,
            state: Mutex::new(CaptureState {
                active: true,
                chunker,
                pointer: Sampler::new(self.config.pointer_sample_period),
                scroll: Sampler::new(self.config.scroll_sample_period),
            }),
            uploads: Mutex::new(JoinSet::new()),
        });
        inner.dispatch(opening);

        let timer = spawn_flush_timer(Arc::downgrade(&inner), self.config.flush_interval);
        info!(
            session_id = %session.session_id,
            resumed,
            first_idx,
            "capture started"
        );
        Ok(CaptureSession {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }
}

fn spawn_flush_timer(inner: Weak<CaptureInner>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.flush(false);
        }
    })
}

struct CaptureState {
    active: bool,
    chunker: Chunker,
    pointer: Sampler<(f64, f64)>,
    scroll: Sampler<(f64, f64)>,
}

impl CaptureState {
    fn drain_samplers(&mut self) {
        if let Some((ts, (x, y))) = self.pointer.drain() {
            self.chunker
                .push(SessionEvent::new(ts, EventKind::Pointer { x, y }));
        }
        if let Some((ts, (x, y))) = self.scroll.drain() {
            self.chunker
                .push(SessionEvent::new(ts, EventKind::Scroll { x, y }));
        }
    }
}

struct CaptureInner {
    session_id: SessionId,
    endpoint: String,
    registry: Arc<dyn SessionRegistry>,
    uploader: Uploader,
    /// Runtime the session started on; uploads are spawned here even when
    /// `flush` is called from a foreign thread.
    runtime: Handle,
    clock: SessionClock,
    first_idx: u64,
    state: Mutex<CaptureState>,
    uploads: Mutex<JoinSet<()>>,
}

impl CaptureInner {
    /// Stamp and buffer one event under the session lock.
    fn record(&self, build: impl FnOnce(&mut CaptureState, u64)) -> Result<(), CaptureError> {
        {
            let mut state = self.state.lock();
            if !state.active {
                return Err(CaptureError::NotActive(self.session_id.clone()));
            }
            let now = self.clock.now_ms();
            build(&mut state, now);
        }
        self.registry.touch(&self.session_id);
        Ok(())
    }

    /// Seal and dispatch the buffer. The session lock is held until the
    /// upload task is registered, so `stop` never misses an upload. Unless
    /// `closing`, an inactive session flushes nothing.
    fn flush(&self, closing: bool) -> Option<u64> {
        let mut state = self.state.lock();
        if !state.active && !closing {
            return None;
        }
        state.drain_samplers();
        let now = self.clock.now_ms();
        match state.chunker.flush(now) {
            Ok(Some(chunk)) => {
                self.registry
                    .advance_cursor(&self.session_id, state.chunker.cursor().clone());
                let idx = chunk.idx;
                self.dispatch(chunk);
                Some(idx)
            }
            Ok(None) => None,
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "could not seal chunk");
                None
            }
        }
    }

    /// Hand a sealed chunk to the uploader without blocking capture.
    fn dispatch(&self, chunk: Chunk) {
        debug!(
            session_id = %self.session_id,
            idx = chunk.idx,
            events = chunk.events.len(),
            digest = %chunk.digest.short(),
            "chunk sealed"
        );
        let uploader = self.uploader.clone();
        let endpoint = self.endpoint.clone();
        let mut uploads = self.uploads.lock();
        while uploads.try_join_next().is_some() {}
        uploads.spawn_on(
            async move {
                // Outcome is logged and published by the uploader.
                let _ = uploader.deliver(&chunk, &endpoint).await;
            },
            &self.runtime,
        );
    }
}

/// What a stopped capture produced. Upload counters are those of the
/// recorder's uploader and accumulate across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub session_id: SessionId,
    pub chunks_emitted: u64,
    pub cursor: ChunkCursor,
    pub uploads: UploadStatsSnapshot,
}

/// Handle to a running capture. Signal handlers and [`CaptureSession::flush`]
/// are synchronous and may be called from any thread; sealing and delivery
/// happen on the flush timer and upload tasks.
///
/// Dropping the handle without [`CaptureSession::stop`] cancels the timer
/// and any upload still in flight.
pub struct CaptureSession {
    inner: Arc<CaptureInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSession {
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Events buffered since the last flush, excluding held samples.
    pub fn pending_events(&self) -> usize {
        self.inner.state.lock().chunker.pending()
    }

    pub fn cursor(&self) -> ChunkCursor {
        self.inner.state.lock().chunker.cursor().clone()
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.uploader.hub().subscribe()
    }

    pub fn on_pointer(&self, x: f64, y: f64) -> Result<(), CaptureError> {
        self.inner.record(|state, now| {
            if let Some((ts, (x, y))) = state.pointer.offer(now, (x, y)) {
                state
                    .chunker
                    .push(SessionEvent::new(ts, EventKind::Pointer { x, y }));
            }
        })
    }

    pub fn on_click(&self, x: f64, y: f64, target: Option<ClickTarget>) -> Result<(), CaptureError> {
        self.inner.record(|state, now| {
            state
                .chunker
                .push(SessionEvent::new(now, EventKind::Click { x, y, target }));
        })
    }

    pub fn on_scroll(&self, x: f64, y: f64) -> Result<(), CaptureError> {
        self.inner.record(|state, now| {
            if let Some((ts, (x, y))) = state.scroll.offer(now, (x, y)) {
                state
                    .chunker
                    .push(SessionEvent::new(ts, EventKind::Scroll { x, y }));
            }
        })
    }

    /// Record one batch of structural changes as a single mutation event.
    /// Ops that failed to encode become placeholders; the batch survives.
    pub fn on_structural_change<I>(&self, ops: I) -> Result<(), CaptureError>
    where
        I: IntoIterator<Item = Result<MutationOp, SerializationError>>,
    {
        let ops: Vec<MutationOp> = ops.into_iter().map(MutationOp::or_placeholder).collect();
        if ops.is_empty() {
            return Ok(());
        }
        let placeholders = ops.iter().filter(|op| op.is_placeholder()).count();
        if placeholders > 0 {
            warn!(
                session_id = %self.inner.session_id,
                placeholders,
                "mutation batch contained unencodable ops"
            );
        }
        self.inner.record(|state, now| {
            state
                .chunker
                .push(SessionEvent::new(now, EventKind::Mutation { ops }));
        })
    }

    pub fn on_route(&self, path: impl Into<String>) -> Result<(), CaptureError> {
        let path = path.into();
        self.inner.record(|state, now| {
            state
                .chunker
                .push(SessionEvent::new(now, EventKind::Route { path }));
        })
    }

    /// Seal the buffer now instead of waiting for the timer. Returns the
    /// emitted chunk's idx, or `None` when the buffer was empty.
    pub fn flush(&self) -> Result<Option<u64>, CaptureError> {
        if !self.is_active() {
            return Err(CaptureError::NotActive(self.inner.session_id.clone()));
        }
        Ok(self.inner.flush(false))
    }

    /// Stop the timer, flush the remainder and wait for every in-flight
    /// upload to finish or exhaust its retries. With `end_session` the
    /// registry forgets the session so the next start gets a fresh identity.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn stop(&self, end_session: bool) -> CaptureSummary {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        let was_active = std::mem::replace(&mut self.inner.state.lock().active, false);
        if was_active {
            self.inner.flush(true);
        }

        let mut uploads = std::mem::take(&mut *self.inner.uploads.lock());
        while let Some(joined) = uploads.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "upload task did not complete");
            }
        }

        if end_session {
            self.inner.registry.invalidate(&self.inner.session_id);
        }

        let cursor = self.cursor();
        let summary = CaptureSummary {
            session_id: self.inner.session_id.clone(),
            chunks_emitted: cursor.next_idx - self.inner.first_idx,
            cursor,
            uploads: self.inner.uploader.stats(),
        };
        info!(
            chunks = summary.chunks_emitted,
            delivered = summary.uploads.delivered,
            dropped = summary.uploads.dropped,
            "capture stopped"
        );
        summary
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
