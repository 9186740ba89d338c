use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tapedeck_capture::{CaptureConfig, InMemorySessionRegistry, Recorder};
use tapedeck_protocol::{
    CaptureError, Chunk, ChunkTransport, EnvironmentError, EventKind, FingerprintProducer,
    Keyframe, KeyframeSource, MutationOp, NodeDescriptor, SerializationError, SessionRegistry,
    TransportError, Viewport, verify_chain,
};
use tapedeck_transport::DeliveryOutcome;

struct StaticPage {
    fail: bool,
}

#[async_trait]
impl KeyframeSource for StaticPage {
    async fn capture_keyframe(&self) -> Result<Keyframe, EnvironmentError> {
        if self.fail {
            return Err(EnvironmentError::new("document not ready"));
        }
        Ok(Keyframe {
            doctype: "<!DOCTYPE html>".into(),
            markup: "<html><body><main id=\"app\"></main></body></html>".into(),
            style_rules: vec!["main { margin: 0 }".into()],
            viewport: Viewport {
                width: 1440,
                height: 900,
            },
        })
    }
}

#[async_trait]
impl FingerprintProducer for StaticPage {
    async fn compute_fingerprint(&self) -> Result<String, EnvironmentError> {
        Ok("dvf-test".into())
    }
}

#[derive(Default)]
struct RecordingTransport {
    fail: bool,
    attempts: AtomicU32,
    sent: Mutex<Vec<Chunk>>,
}

#[async_trait]
impl ChunkTransport for RecordingTransport {
    async fn send(&self, _endpoint: &str, chunk: &Chunk) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TransportError::Status {
                status: 503,
                body: "collector down".into(),
            });
        }
        self.sent.lock().push(chunk.clone());
        Ok(())
    }
}

impl RecordingTransport {
    fn chunks(&self) -> Vec<Chunk> {
        let mut chunks = self.sent.lock().clone();
        chunks.sort_by_key(|chunk| chunk.idx);
        chunks
    }
}

fn recorder(
    transport: Arc<RecordingTransport>,
    registry: Arc<InMemorySessionRegistry>,
    keyframe_fails: bool,
) -> Recorder {
    let page = Arc::new(StaticPage {
        fail: keyframe_fails,
    });
    Recorder::builder(CaptureConfig::new("proj-test").with_user("u-42"), page.clone(), page)
        .registry(registry)
        .transport(transport)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn capture_emits_linked_chunks_with_a_single_keyframe() {
    let transport = Arc::new(RecordingTransport::default());
    let registry = Arc::new(InMemorySessionRegistry::default());
    let recorder = recorder(transport.clone(), registry, false);

    let session = recorder.start().await.unwrap();
    session.on_click(10.0, 20.0, None).unwrap();
    session.on_route("/checkout").unwrap();
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    session.on_scroll(0.0, 300.0).unwrap();
    let summary = session.stop(false).await;

    let chunks = transport.chunks();
    assert_eq!(summary.chunks_emitted, 3);
    assert_eq!(summary.uploads.delivered, 3);
    assert_eq!(chunks.iter().map(|c| c.idx).collect::<Vec<_>>(), vec![0, 1, 2]);

    assert!(chunks[0].has_snapshot);
    assert_eq!(chunks[0].events[0].timestamp_ms, 0);
    let snapshots: usize = chunks.iter().map(Chunk::snapshot_count).sum();
    assert_eq!(snapshots, 1);

    assert_eq!(chunks[1].start_ts, chunks[0].end_ts);
    assert_eq!(chunks[1].end_ts, 5_000);
    assert!(chunks.iter().all(|c| c.validate().is_ok()));
    assert!(chunks.iter().all(|c| c.fingerprint == "dvf-test"));
    assert!(chunks.iter().all(|c| c.user.as_ref().is_some_and(|u| u.id.as_str() == "u-42")));
    assert!(verify_chain(&chunks).is_intact());
}

#[tokio::test(start_paused = true)]
async fn idle_intervals_emit_nothing() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport.clone(), Arc::default(), false);

    let session = recorder.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let summary = session.stop(false).await;

    assert_eq!(summary.chunks_emitted, 1);
    assert_eq!(transport.chunks().len(), 1);
}

#[tokio::test]
async fn init_failure_emits_nothing() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport.clone(), Arc::default(), true);

    let err = recorder.start().await.err().unwrap();
    assert!(matches!(err, CaptureError::Init(_)));
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
}

#[test]
fn builder_falls_back_to_http_transport() {
    let page = Arc::new(StaticPage { fail: false });
    let built = Recorder::builder(CaptureConfig::new("proj-test"), page.clone(), page).build();
    assert!(built.is_ok());
}

#[tokio::test]
async fn flush_from_a_foreign_thread_still_delivers() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport.clone(), Arc::default(), false);
    let session = Arc::new(recorder.start().await.unwrap());

    let worker = session.clone();
    let flushed = std::thread::spawn(move || {
        worker.on_click(4.0, 2.0, None)?;
        worker.flush()
    })
    .join()
    .unwrap()
    .unwrap();
    assert_eq!(flushed, Some(1));

    let summary = session.stop(false).await;
    assert_eq!(summary.uploads.delivered, 2);
    assert_eq!(transport.chunks().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stopped_session_rejects_signals() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport, Arc::default(), false);

    let session = recorder.start().await.unwrap();
    session.stop(false).await;
    assert!(!session.is_active());
    assert!(matches!(
        session.on_pointer(1.0, 1.0),
        Err(CaptureError::NotActive(_))
    ));
    assert!(matches!(session.flush(), Err(CaptureError::NotActive(_))));
}

#[tokio::test(start_paused = true)]
async fn pointer_flood_is_throttled() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport.clone(), Arc::default(), false);

    let session = recorder.start().await.unwrap();
    for step in 0..1_000 {
        session.on_pointer(step as f64, 0.0).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    session.stop(false).await;

    let pointer_events = transport
        .chunks()
        .iter()
        .flat_map(|chunk| chunk.events.iter())
        .filter(|event| matches!(event.kind, EventKind::Pointer { .. }))
        .count();
    // 1000 ms at 50 ms per sample.
    assert!(pointer_events <= 21, "{pointer_events} pointer samples");
    assert!(pointer_events >= 19);
}

#[tokio::test(start_paused = true)]
async fn unencodable_ops_become_placeholders() {
    let transport = Arc::new(RecordingTransport::default());
    let recorder = recorder(transport.clone(), Arc::default(), false);

    let session = recorder.start().await.unwrap();
    session
        .on_structural_change([
            Ok(MutationOp::StructureChange {
                parent_path: "html>body>main".into(),
                added: vec![NodeDescriptor::element("div").with_attribute("id", "toast")],
                removed: vec![],
            }),
            Err(SerializationError::new("attribute value", "cyclic reference")),
        ])
        .unwrap();
    session.stop(false).await;

    let chunks = transport.chunks();
    let EventKind::Mutation { ops } = &chunks[1].events[0].kind else {
        panic!("expected a mutation event, got {:?}", chunks[1].events[0]);
    };
    assert_eq!(ops.len(), 2);
    assert!(!ops[0].is_placeholder());
    assert!(ops[1].is_placeholder());
}

#[tokio::test(start_paused = true)]
async fn failed_uploads_do_not_disturb_sequencing() {
    let transport = Arc::new(RecordingTransport {
        fail: true,
        ..Default::default()
    });
    let recorder = recorder(transport.clone(), Arc::default(), false);

    let session = recorder.start().await.unwrap();
    let mut outcomes = session.subscribe_deliveries();
    let mut flushed = Vec::new();
    for n in 0..4 {
        session.on_click(n as f64, 0.0, None).unwrap();
        flushed.push(session.flush().unwrap());
    }
    let summary = session.stop(false).await;

    assert_eq!(flushed, vec![Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(summary.cursor.next_idx, 5);
    assert_eq!(summary.uploads.dropped, 5);
    assert_eq!(summary.uploads.delivered, 0);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 15);

    let mut dropped = Vec::new();
    while let Ok(outcome) = outcomes.try_recv() {
        if let DeliveryOutcome::Dropped { idx, .. } = outcome {
            dropped.push(idx);
        }
    }
    dropped.sort_unstable();
    assert_eq!(dropped, vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn resumed_capture_continues_the_chain_with_a_resync_keyframe() {
    let transport = Arc::new(RecordingTransport::default());
    let registry = Arc::new(InMemorySessionRegistry::default());
    let recorder = recorder(transport.clone(), registry.clone(), false);

    let first = recorder.start().await.unwrap();
    first.on_click(1.0, 1.0, None).unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let before = first.stop(false).await;
    drop(first);

    let second = recorder.start().await.unwrap();
    assert_eq!(second.session_id(), &before.session_id);
    second.on_click(2.0, 2.0, None).unwrap();
    second.stop(true).await;

    let chunks = transport.chunks();
    assert_eq!(chunks.iter().map(|c| c.idx).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert!(chunks[2].has_snapshot);
    assert!(chunks[2].start_ts >= chunks[1].end_ts);
    assert_eq!(chunks[2].prev_digest.as_ref(), Some(&chunks[1].digest));
    assert!(verify_chain(&chunks).is_intact());

    // end_session released the identity.
    assert!(registry.get(&before.session_id).is_none());
    let fresh = registry.get_or_create(&"proj-test".into(), Some(&"u-42".into()));
    assert_ne!(fresh.session_id, before.session_id);
    assert!(fresh.cursor.is_fresh());
}
