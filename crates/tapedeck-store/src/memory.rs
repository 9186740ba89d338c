use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tapedeck_protocol::{Chunk, SessionId, SessionRecord, SessionSummary, verify_chain};

use crate::{ChunkStore, PutOutcome, StoreError, StoredChunk, admit, summarize, validate_session_id};

/// Non-persistent store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    sessions: Mutex<HashMap<SessionId, BTreeMap<u64, StoredChunk>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(
        &self,
        chunk: &Chunk,
        received_at: DateTime<Utc>,
    ) -> Result<PutOutcome, StoreError> {
        validate_session_id(&chunk.session_id)?;
        let mut sessions = self.sessions.lock();
        let stored = sessions.entry(chunk.session_id.clone()).or_default();
        if stored
            .values()
            .next()
            .is_some_and(|first| first.chunk.project_key != chunk.project_key)
        {
            return Err(StoreError::ProjectMismatch {
                session_id: chunk.session_id.clone(),
            });
        }
        let outcome = admit(chunk, stored.get(&chunk.idx).map(|entry| &entry.chunk.digest))?;
        if outcome == PutOutcome::Inserted {
            stored.insert(
                chunk.idx,
                StoredChunk {
                    received_at,
                    chunk: chunk.clone(),
                },
            );
        }
        Ok(outcome)
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let sessions = self.sessions.lock();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .filter_map(|(id, stored)| {
                let entries: Vec<StoredChunk> = stored.values().cloned().collect();
                summarize(id, &entries)
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }

    async fn session(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionRecord>> {
        let entries: Vec<StoredChunk> = match self.sessions.lock().get(session_id) {
            Some(stored) => stored.values().cloned().collect(),
            None => return Ok(None),
        };
        let Some(summary) = summarize(session_id, &entries) else {
            return Ok(None);
        };
        let chunks: Vec<Chunk> = entries.into_iter().map(|entry| entry.chunk).collect();
        let integrity = verify_chain(&chunks);
        Ok(Some(SessionRecord {
            summary,
            chunks,
            integrity: Some(integrity),
        }))
    }
}

#[cfg(test)]
mod tests {
    use tapedeck_protocol::{Digest, SessionEvent, EventKind};

    use super::*;

    fn chunk(session: &str, idx: u64, x: f64) -> Chunk {
        let events = vec![SessionEvent::new(idx * 10, EventKind::Pointer { x, y: 0.0 })];
        Chunk {
            session_id: session.into(),
            project_key: "proj".into(),
            idx,
            start_ts: idx * 10,
            end_ts: idx * 10 + 10,
            has_snapshot: false,
            digest: Chunk::digest_events(&events).unwrap(),
            prev_digest: None,
            fingerprint: "fp".into(),
            user: None,
            events,
            encoded_events: None,
        }
    }

    #[tokio::test]
    async fn memory_store_mirrors_idempotency_rules() {
        let store = MemoryChunkStore::new();
        let now = Utc::now();
        assert_eq!(store.put(&chunk("s1", 0, 1.0), now).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(&chunk("s1", 0, 1.0), now).await.unwrap(), PutOutcome::Duplicate);
        assert!(matches!(
            store.put(&chunk("s1", 0, 2.0), now).await,
            Err(StoreError::Conflict { .. })
        ));

        let mut other = chunk("s1", 1, 1.0);
        other.project_key = "elsewhere".into();
        other.digest = Digest::from_hex("00".repeat(32));
        assert!(matches!(
            store.put(&other, now).await,
            Err(StoreError::ProjectMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_returns_sessions_in_idx_order() {
        let store = MemoryChunkStore::new();
        let now = Utc::now();
        store.put(&chunk("s2", 1, 1.0), now).await.unwrap();
        store.put(&chunk("s2", 0, 1.0), now).await.unwrap();
        store.put(&chunk("s3", 0, 1.0), now).await.unwrap();

        let record = store.session(&"s2".into()).await.unwrap().unwrap();
        assert_eq!(record.chunks.iter().map(|c| c.idx).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(store.list_sessions().await.unwrap().len(), 2);
        assert!(store.session(&"nope".into()).await.unwrap().is_none());
    }
}
