//! # tapedeck-protocol: canonical capture/replay contract
//!
//! Shared types, the event taxonomy, the chunk wire format, and the trait
//! interfaces that the capture, transport, storage and replay crates depend
//! on.
//!
//! It is intentionally runtime-free (no tokio, reqwest or axum) so it can be
//! used as a pure contract crate on both sides of the collector.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, ProjectKey, UserId, Digest)
//! - [`hash`]: Content-addressing primitive (SHA-256, lowercase hex)
//! - [`event`]: SessionEvent + EventKind, MutationOp, Keyframe (forward-compatible)
//! - [`chunk`]: Chunk wire format, digest computation, chain verification
//! - [`session`]: SessionInfo, ChunkCursor, SessionSummary
//! - [`ports`]: Boundary ports (registry, environment, transport, render surface)
//! - [`error`]: Error taxonomy per subsystem

pub mod chunk;
pub mod error;
pub mod event;
pub mod hash;
pub mod ids;
pub mod ports;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use chunk::{
    ChainBreak, ChainFault, ChainReport, Chunk, ChunkFault, ChunkUser, EncodedEvents, verify_chain,
};
pub use error::{
    CaptureError, DeliveryError, EnvironmentError, ReplayError, SerializationError, SurfaceError,
    TransportError,
};
pub use event::{
    ClickTarget, EventKind, Keyframe, MutationOp, NodeDescriptor, SessionEvent, Viewport,
};
pub use hash::{hash, hash_json};
pub use ids::{Digest, ProjectKey, SessionId, UserId};
pub use ports::{
    ChunkTransport, FingerprintProducer, KeyframeSource, RenderSurface, SessionRegistry,
};
pub use session::{ChunkCursor, SessionInfo, SessionRecord, SessionSummary};
