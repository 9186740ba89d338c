use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tapedeck_protocol::{
    Chunk, Digest, ProjectKey, SessionId, SessionRecord, SessionSummary, verify_chain,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

use crate::{ChunkStore, PutOutcome, StoreError, StoredChunk, admit, summarize, validate_session_id};

/// Digests already on disk for one session, keyed by idx.
#[derive(Debug, Clone, Default)]
struct SessionIndex {
    project_key: Option<ProjectKey>,
    digests: HashMap<u64, Digest>,
}

/// Append-only JSONL store, one file per session under `<root>/sessions`.
#[derive(Debug)]
pub struct FileChunkStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    index_cache: Mutex<HashMap<SessionId, SessionIndex>>,
}

impl FileChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            index_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn file_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.jsonl", session_id.as_str()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create sessions dir {parent:?}"))?;
        }
        Ok(())
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_stored(path: &Path) -> Result<Vec<StoredChunk>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .with_context(|| format!("failed opening chunk log {path:?}"))?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let stored: StoredChunk = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing chunk line in {path:?}"))?;
            out.push(stored);
        }
        Ok(out)
    }

    async fn scan_index(path: &Path) -> Result<SessionIndex> {
        let stored = Self::read_stored(path).await?;
        let mut index = SessionIndex::default();
        for entry in stored {
            if index.project_key.is_none() {
                index.project_key = Some(entry.chunk.project_key.clone());
            }
            index.digests.insert(entry.chunk.idx, entry.chunk.digest);
        }
        Ok(index)
    }

    fn cached_index(&self, session_id: &SessionId) -> Option<SessionIndex> {
        self.index_cache.lock().get(session_id).cloned()
    }

    fn record_in_cache(&self, chunk: &Chunk) {
        let mut cache = self.index_cache.lock();
        let index = cache.entry(chunk.session_id.clone()).or_default();
        if index.project_key.is_none() {
            index.project_key = Some(chunk.project_key.clone());
        }
        index.digests.insert(chunk.idx, chunk.digest.clone());
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<Vec<StoredChunk>> {
        let mut stored = Self::read_stored(&self.file_path(session_id)).await?;
        stored.sort_by_key(|entry| entry.chunk.idx);
        Ok(stored)
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    #[instrument(
        skip(self, chunk),
        fields(session_id = %chunk.session_id, idx = chunk.idx, digest = %chunk.digest.short())
    )]
    async fn put(
        &self,
        chunk: &Chunk,
        received_at: DateTime<Utc>,
    ) -> Result<PutOutcome, StoreError> {
        validate_session_id(&chunk.session_id)?;
        let path = self.file_path(&chunk.session_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(&chunk.session_id);
        let _guard = lock.lock().await;

        let index = match self.cached_index(&chunk.session_id) {
            Some(index) => index,
            None => {
                let index = Self::scan_index(&path).await?;
                self.index_cache
                    .lock()
                    .insert(chunk.session_id.clone(), index.clone());
                index
            }
        };

        if index
            .project_key
            .as_ref()
            .is_some_and(|key| *key != chunk.project_key)
        {
            warn!("chunk project does not match the stored session");
            return Err(StoreError::ProjectMismatch {
                session_id: chunk.session_id.clone(),
            });
        }

        let outcome = admit(chunk, index.digests.get(&chunk.idx)).inspect_err(|_| {
            warn!("conflicting chunk for an already stored index");
        })?;
        if outcome.is_duplicate() {
            debug!("duplicate chunk acknowledged");
            return Ok(outcome);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening chunk log {path:?}"))?;

        let stored = StoredChunk {
            received_at,
            chunk: chunk.clone(),
        };
        let line = serde_json::to_string(&stored).context("failed serializing chunk")?;
        file.write_all(line.as_bytes())
            .await
            .context("failed writing chunk")?;
        file.write_all(b"\n").await.context("failed writing chunk")?;
        file.flush().await.context("failed flushing chunk log")?;
        self.record_in_cache(chunk);
        debug!("chunk appended to store");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed reading sessions dir {dir:?}"))?;
        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let session_id = SessionId::from_string(stem);
            let stored = Self::read_stored(&path).await?;
            if let Some(summary) = summarize(&session_id, &stored) {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        debug!(count = summaries.len(), "sessions listed");
        Ok(summaries)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        if validate_session_id(session_id).is_err() {
            return Ok(None);
        }
        let stored = self.load_session(session_id).await?;
        let Some(summary) = summarize(session_id, &stored) else {
            return Ok(None);
        };

        let chunks: Vec<Chunk> = stored.into_iter().map(|entry| entry.chunk).collect();
        let integrity = verify_chain(&chunks);
        if let Some(fault) = &integrity.first_break {
            warn!(idx = fault.idx, fault = ?fault.fault, "session chain is broken");
        }
        debug!(chunks = chunks.len(), trusted = integrity.trusted, "session loaded");
        Ok(Some(SessionRecord {
            summary,
            chunks,
            integrity: Some(integrity),
        }))
    }
}
