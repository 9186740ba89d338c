use tokio::time::Instant;

/// Session-relative millisecond clock.
///
/// `offset_ms` is how far into the session this capture instance starts;
/// zero for a fresh session, the elapsed time for a resumed one.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
    offset_ms: u64,
}

impl SessionClock {
    pub fn starting_at(offset_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            offset_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.offset_ms + self.origin.elapsed().as_millis() as u64
    }

    pub fn offset_ms(&self) -> u64 {
        self.offset_ms
    }
}
