//! Error taxonomy, one enum per subsystem.

use thiserror::Error;

use crate::ids::SessionId;

/// Errors that stop a capture session from starting or accepting signals.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The environment could not produce an initial keyframe or fingerprint.
    #[error("capture init failed: {0}")]
    Init(#[from] EnvironmentError),
    #[error("capture is not active for session {0}")]
    NotActive(SessionId),
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

/// Failure reported by an environment collaborator (keyframe source,
/// fingerprint producer).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EnvironmentError(pub String);

impl EnvironmentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An individual event or op could not be encoded. Always recovered locally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not encode {what}: {reason}")]
pub struct SerializationError {
    pub what: String,
    pub reason: String,
}

impl SerializationError {
    pub fn new(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("json payload", err.to_string())
    }
}

/// A single transport attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("collector responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("encoding error: {0}")]
    Encode(String),
    /// The HTTP client could not be constructed.
    #[error("http client error: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// One attempt failed; the uploader retries after backoff.
    #[error("delivery attempt {attempt} failed: {source}")]
    Transient {
        attempt: u32,
        #[source]
        source: TransportError,
    },
    /// Every attempt failed. The chunk is dropped.
    #[error("delivery exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
}

/// Failure reported by a render surface while applying replay effects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("surface rejected operation: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReplayError {
    #[error("no keyframe snapshot found among the session's chunks")]
    MissingSnapshot,
    #[error("failed to reconstruct keyframe: {0}")]
    Reconstruction(String),
    #[error("event at {timestamp_ms}ms failed to apply: {reason}")]
    ApplyFailure { timestamp_ms: u64, reason: String },
    #[error("invalid playback speed: {0}")]
    InvalidSpeed(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_carries_last_error() {
        let err = DeliveryError::Exhausted {
            attempts: 3,
            last: TransportError::Status {
                status: 503,
                body: "busy".into(),
            },
        };
        let rendered = err.to_string();
        assert!(rendered.contains("3 attempts"));
        assert!(rendered.contains("503"));
    }

    #[test]
    fn capture_init_wraps_environment_error() {
        let err: CaptureError = EnvironmentError::new("document has no root element").into();
        assert!(matches!(err, CaptureError::Init(_)));
        assert!(err.to_string().contains("no root element"));
    }
}
