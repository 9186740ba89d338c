//! Chunk storage behind the collector.
//!
//! Ingest is idempotent on `(sessionId, idx)`: re-delivering a chunk with the
//! same digest is acknowledged as a duplicate, a different digest under an
//! existing index is a conflict. Reads return chunks in idx order together
//! with a chain verification report.

mod file;
mod memory;
mod summary;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tapedeck_protocol::{Chunk, Digest, SessionId, SessionRecord, SessionSummary};
use thiserror::Error;

pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;
pub use summary::summarize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PutOutcome {
    Inserted,
    Duplicate,
}

impl PutOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("chunk {idx} of session {session_id} already stored with a different digest")]
    Conflict { session_id: SessionId, idx: u64 },
    #[error("session {session_id} belongs to another project")]
    ProjectMismatch { session_id: SessionId },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A chunk as persisted, with the collector's receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub received_at: DateTime<Utc>,
    pub chunk: Chunk,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put(&self, chunk: &Chunk, received_at: DateTime<Utc>)
    -> Result<PutOutcome, StoreError>;
    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>>;
    /// Metadata, ordered chunks and integrity report of one session.
    async fn session(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionRecord>>;
}

/// Session ids become file names; only a conservative alphabet is accepted.
pub fn validate_session_id(session_id: &SessionId) -> Result<(), StoreError> {
    let id = session_id.as_str();
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(id.to_owned()))
    }
}

/// Idempotency decision for a chunk against the digest already stored under
/// its index, if any.
pub(crate) fn admit(chunk: &Chunk, existing: Option<&Digest>) -> Result<PutOutcome, StoreError> {
    match existing {
        None => Ok(PutOutcome::Inserted),
        Some(digest) if *digest == chunk.digest => Ok(PutOutcome::Duplicate),
        Some(_) => Err(StoreError::Conflict {
            session_id: chunk.session_id.clone(),
            idx: chunk.idx,
        }),
    }
}
