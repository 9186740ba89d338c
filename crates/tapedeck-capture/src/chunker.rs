//! Buffer-to-chunk sealing with hash-chain linkage.

use tapedeck_protocol::{
    Chunk, ChunkCursor, ChunkUser, Keyframe, ProjectKey, SerializationError, SessionEvent,
    SessionId, SessionInfo,
};

/// Accumulates events and seals them into sequenced, hash-linked chunks.
///
/// Not thread-safe on its own; the recorder keeps it behind the session lock
/// so stamping, buffering and sealing are serialized.
#[derive(Debug)]
pub struct Chunker {
    session_id: SessionId,
    project_key: ProjectKey,
    fingerprint: String,
    user: Option<ChunkUser>,
    cursor: ChunkCursor,
    last_end_ts: u64,
    buffer: Vec<SessionEvent>,
}

impl Chunker {
    /// Continue the chain where `session.cursor` left off. `start_ts` is the
    /// session-relative time this capture instance begins at; it never
    /// precedes the end of the previous chunk.
    pub fn new(session: &SessionInfo, fingerprint: impl Into<String>, start_ts: u64) -> Self {
        Self {
            session_id: session.session_id.clone(),
            project_key: session.project_key.clone(),
            fingerprint: fingerprint.into(),
            user: session.user_id.clone().map(|id| ChunkUser { id }),
            cursor: session.cursor.clone(),
            last_end_ts: start_ts.max(session.cursor.last_end_ts),
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, event: SessionEvent) {
        self.buffer.push(event);
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn cursor(&self) -> &ChunkCursor {
        &self.cursor
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Seal the opening chunk: the keyframe snapshot first, then anything
    /// already buffered. On a resumed session this is a re-sync chunk that
    /// continues the existing chain.
    pub fn begin(&mut self, keyframe: Keyframe, now_ms: u64) -> Result<Chunk, SerializationError> {
        let mut events = Vec::with_capacity(self.buffer.len() + 1);
        events.push(SessionEvent::snapshot(self.last_end_ts, keyframe));
        events.append(&mut self.sorted_buffer());
        self.seal(events, true, now_ms)
    }

    /// Seal the buffer into the next chunk. An empty buffer produces nothing
    /// and leaves the sequence untouched.
    pub fn flush(&mut self, now_ms: u64) -> Result<Option<Chunk>, SerializationError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let events = self.sorted_buffer();
        self.seal(events, false, now_ms).map(Some)
    }

    fn sorted_buffer(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.buffer);
        events.sort_by_key(|event| event.timestamp_ms);
        events
    }

    fn seal(
        &mut self,
        events: Vec<SessionEvent>,
        has_snapshot: bool,
        now_ms: u64,
    ) -> Result<Chunk, SerializationError> {
        let digest = Chunk::digest_events(&events)?;

        let start_ts = self.last_end_ts;
        let last_event_ts = events.last().map_or(start_ts, |event| event.timestamp_ms);
        let end_ts = now_ms.max(last_event_ts).max(start_ts);

        let chunk = Chunk {
            session_id: self.session_id.clone(),
            project_key: self.project_key.clone(),
            idx: self.cursor.next_idx,
            start_ts,
            end_ts,
            has_snapshot,
            digest: digest.clone(),
            prev_digest: self.cursor.last_digest.clone(),
            fingerprint: self.fingerprint.clone(),
            user: self.user.clone(),
            events,
            encoded_events: None,
        };

        self.cursor = ChunkCursor {
            next_idx: chunk.idx + 1,
            last_digest: Some(digest),
            last_end_ts: end_ts,
        };
        self.last_end_ts = end_ts;
        Ok(chunk)
    }
}
