//! Capture side of tapedeck: environment signals in, hash-chained chunks out.
//!
//! [`Recorder`] obtains a session identity from a
//! [`SessionRegistry`](tapedeck_protocol::SessionRegistry), captures the
//! keyframe, and hands back a [`CaptureSession`] whose `on_*` handlers accept
//! signals. A background timer flushes the buffer into chunks every
//! `flush_interval`; each chunk is delivered out-of-band by the
//! [`Uploader`](tapedeck_transport::Uploader).

mod chunker;
mod clock;
mod config;
mod recorder;
mod registry;
mod sampler;

pub use chunker::Chunker;
pub use clock::SessionClock;
pub use config::CaptureConfig;
pub use recorder::{CaptureSession, CaptureSummary, Recorder, RecorderBuilder};
pub use registry::{InMemorySessionRegistry, NowFn, RegistryConfig};
pub use sampler::Sampler;
