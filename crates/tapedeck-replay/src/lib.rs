//! Deterministic replay of captured sessions.
//!
//! [`ReplayEngine`] owns a [`RenderSurface`](tapedeck_protocol::RenderSurface),
//! rebuilds it from the session keyframe and re-applies events against a
//! virtual clock. Mutations carry no inverse, so every seek rebuilds from the
//! keyframe and replays forward. [`ReplayPlayer`] drives the engine from a
//! tokio interval for real-time playback.

mod engine;
mod player;
mod surface;

pub use engine::{Cursor, PlaybackState, ReplayEngine, ReplayStats, TICK};
pub use player::ReplayPlayer;
pub use surface::VirtualSurface;
