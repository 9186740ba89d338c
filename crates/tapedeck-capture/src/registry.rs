//! In-process session registry with inactivity expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tapedeck_protocol::{ChunkCursor, ProjectKey, SessionId, SessionInfo, SessionRegistry, UserId};
use tracing::{debug, info};

/// Wall-clock source, injectable for tests.
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A session with no activity for this long is replaced on the next
    /// `get_or_create`.
    pub inactivity_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Keeps one live session per (project key, user). Expired entries are
/// purged lazily when a new session is created.
pub struct InMemorySessionRegistry {
    config: RegistryConfig,
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
    now: NowFn,
}

impl InMemorySessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            now: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current record for `session_id`, if it is still registered.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn is_live(&self, info: &SessionInfo, now: DateTime<Utc>) -> bool {
        let idle = (now - info.last_activity).to_std().unwrap_or(Duration::ZERO);
        idle < self.config.inactivity_timeout
    }
}

impl Default for InMemorySessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn get_or_create(&self, project_key: &ProjectKey, user_id: Option<&UserId>) -> SessionInfo {
        let now = (self.now)();
        let mut sessions = self.sessions.lock();

        let live = sessions
            .values_mut()
            .filter(|info| &info.project_key == project_key && info.user_id.as_ref() == user_id)
            .find(|info| {
                let idle = (now - info.last_activity).to_std().unwrap_or(Duration::ZERO);
                idle < self.config.inactivity_timeout
            });
        if let Some(info) = live {
            info.last_activity = now;
            debug!(session_id = %info.session_id, next_idx = info.cursor.next_idx, "resuming session");
            return info.clone();
        }

        sessions.retain(|_, info| self.is_live(info, now));
        let info = SessionInfo {
            session_id: SessionId::generate(),
            project_key: project_key.clone(),
            user_id: user_id.cloned(),
            started_at: now,
            last_activity: now,
            cursor: ChunkCursor::default(),
        };
        info!(session_id = %info.session_id, project_key = %project_key, "created session");
        sessions.insert(info.session_id.clone(), info.clone());
        info
    }

    fn touch(&self, session_id: &SessionId) {
        let now = (self.now)();
        if let Some(info) = self.sessions.lock().get_mut(session_id) {
            info.last_activity = now;
        }
    }

    fn invalidate(&self, session_id: &SessionId) {
        if self.sessions.lock().remove(session_id).is_some() {
            info!(session_id = %session_id, "session invalidated");
        }
    }

    fn advance_cursor(&self, session_id: &SessionId, cursor: ChunkCursor) {
        let now = (self.now)();
        if let Some(info) = self.sessions.lock().get_mut(session_id) {
            info.cursor = cursor;
            info.last_activity = now;
        }
    }
}
