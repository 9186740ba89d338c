//! Session identity and query types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChainReport, Chunk};
use crate::ids::{Digest, ProjectKey, SessionId, UserId};

/// Where the next chunk of a session continues: its `idx`, the digest it
/// must link to, and the session time the previous chunk ended at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCursor {
    pub next_idx: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_digest: Option<Digest>,
    #[serde(default)]
    pub last_end_ts: u64,
}

impl ChunkCursor {
    /// True for a session that has not emitted any chunk yet.
    pub fn is_fresh(&self) -> bool {
        self.next_idx == 0
    }
}

/// Identity handed out by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub project_key: ProjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub cursor: ChunkCursor,
}

impl SessionInfo {
    /// Milliseconds from session start to `now`, clamped at zero.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Session metadata as served by the collector's query contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub project_key: ProjectKey,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub chunk_count: usize,
}

impl SessionSummary {
    pub fn duration_ms(&self) -> u64 {
        (self.last_activity - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Metadata plus the full ordered chunk list of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub summary: SessionSummary,
    pub chunks: Vec<Chunk>,
    #[serde(default, skip_deserializing)]
    pub integrity: Option<ChainReport>,
}
