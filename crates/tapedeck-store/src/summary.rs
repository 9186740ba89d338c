use chrono::TimeDelta;
use tapedeck_protocol::{SessionId, SessionSummary};

use crate::StoredChunk;

/// Derive session metadata from stored chunks.
///
/// Session start is estimated per chunk as `receivedAt - endTs` and the
/// earliest estimate wins; last activity is start plus the largest `endTs`.
/// Fingerprint and project come from the lowest-idx chunk, the user from
/// the first chunk that carries one.
pub fn summarize(session_id: &SessionId, stored: &[StoredChunk]) -> Option<SessionSummary> {
    let first = stored.iter().min_by_key(|entry| entry.chunk.idx)?;

    let started_at = stored
        .iter()
        .map(|entry| {
            entry
                .received_at
                .checked_sub_signed(millis(entry.chunk.end_ts))
                .unwrap_or(entry.received_at)
        })
        .min()?;
    let max_end = stored.iter().map(|entry| entry.chunk.end_ts).max()?;
    let user_id = stored
        .iter()
        .find_map(|entry| entry.chunk.user.as_ref().map(|user| user.id.clone()));

    Some(SessionSummary {
        session_id: session_id.clone(),
        project_key: first.chunk.project_key.clone(),
        fingerprint: first.chunk.fingerprint.clone(),
        user_id,
        started_at,
        last_activity: started_at
            .checked_add_signed(millis(max_end))
            .unwrap_or(started_at),
        chunk_count: stored.len(),
    })
}

fn millis(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}
