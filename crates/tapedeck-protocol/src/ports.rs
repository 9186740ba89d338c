//! Boundary ports to external collaborators.
//!
//! These traits are the only allowed seams between the engine and the
//! environment: session identity bookkeeping, keyframe and fingerprint
//! production, chunk transport, and the replay render target.
//!
//! Object-safety note:
//! - Async ports use `async-trait` for dyn-dispatch.
//! - `SessionRegistry` and `RenderSurface` are synchronous: they sit on the
//!   capture signal path and the replay apply loop, neither of which awaits.

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::error::{EnvironmentError, SurfaceError, TransportError};
use crate::event::{Keyframe, MutationOp};
use crate::ids::{ProjectKey, SessionId, UserId};
use crate::session::{ChunkCursor, SessionInfo};

/// Session identity store with inactivity expiry.
pub trait SessionRegistry: Send + Sync {
    /// Return the still-valid session for `project_key` + `user_id`, or
    /// issue a fresh identity.
    fn get_or_create(&self, project_key: &ProjectKey, user_id: Option<&UserId>) -> SessionInfo;
    /// Refresh the activity timestamp.
    fn touch(&self, session_id: &SessionId);
    /// Discard the identity ("end session").
    fn invalidate(&self, session_id: &SessionId);
    /// Persist where the next chunk continues after a chunk was emitted.
    fn advance_cursor(&self, session_id: &SessionId, cursor: ChunkCursor);
}

/// Produces the keyframe of the observed surface.
#[async_trait]
pub trait KeyframeSource: Send + Sync {
    async fn capture_keyframe(&self) -> Result<Keyframe, EnvironmentError>;
}

/// Produces the opaque design-version fingerprint of the observed surface.
#[async_trait]
pub trait FingerprintProducer: Send + Sync {
    async fn compute_fingerprint(&self) -> Result<String, EnvironmentError>;
}

/// One delivery attempt of a chunk to a collector endpoint.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send(&self, endpoint: &str, chunk: &Chunk) -> Result<(), TransportError>;
}

/// Replay target: keyframe reconstruction and delta application.
pub trait RenderSurface: Send {
    /// Rebuild the surface from scratch (markup + style injection).
    fn reconstruct(&mut self, keyframe: &Keyframe) -> Result<(), SurfaceError>;
    fn set_scroll(&mut self, x: f64, y: f64) -> Result<(), SurfaceError>;
    fn apply_mutation(&mut self, op: &MutationOp) -> Result<(), SurfaceError>;
    /// Transient click feedback; never part of state correctness.
    fn pulse(&mut self, _x: f64, _y: f64) {}
    /// Route changes are informational.
    fn navigated(&mut self, _path: &str) {}
}
