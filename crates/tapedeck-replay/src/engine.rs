use std::time::Duration;

use serde::Serialize;
use tapedeck_protocol::{
    Chunk, EventKind, Keyframe, MutationOp, RenderSurface, ReplayError, SessionEvent,
    SessionRecord,
};
use tracing::{debug, instrument, warn};

/// Virtual time step of one playback tick at speed 1.
pub const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub total_duration_ms: u64,
    pub current_time_ms: u64,
    pub speed_multiplier: f64,
    pub playing: bool,
    pub cursor: Cursor,
}

/// Counters for the current pass over the timeline. Reset by `seek`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStats {
    pub applied: usize,
    pub failures: usize,
    /// Unknown event kinds and placeholder or unknown ops.
    pub skipped: usize,
    pub resyncs: usize,
    #[serde(skip)]
    pub last_failure: Option<ReplayError>,
}

/// Replays one loaded session against a render surface.
pub struct ReplayEngine<S> {
    surface: S,
    keyframe: Keyframe,
    /// Every event after the initial keyframe, stable-sorted by timestamp.
    /// Later snapshots stay in place as re-sync points.
    timeline: Vec<SessionEvent>,
    next: usize,
    clock_ms: f64,
    state: PlaybackState,
    stats: ReplayStats,
}

impl<S: RenderSurface> ReplayEngine<S> {
    /// Load a session from its chunks in any order. The total duration is
    /// the timestamp of the last non-snapshot event.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub fn load(surface: S, chunks: &[Chunk]) -> Result<Self, ReplayError> {
        Self::load_inner(surface, chunks, None)
    }

    /// Load a session served by a collector; the total duration comes from
    /// its metadata.
    #[instrument(skip_all, fields(session_id = %record.summary.session_id))]
    pub fn load_record(surface: S, record: &SessionRecord) -> Result<Self, ReplayError> {
        Self::load_inner(surface, &record.chunks, Some(record.summary.duration_ms()))
    }

    fn load_inner(
        mut surface: S,
        chunks: &[Chunk],
        total_duration_ms: Option<u64>,
    ) -> Result<Self, ReplayError> {
        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|chunk| chunk.idx);

        let mut keyframe = None;
        let mut timeline = Vec::new();
        for event in ordered.into_iter().flat_map(|chunk| chunk.events.iter()) {
            match &event.kind {
                EventKind::Snapshot { keyframe: first } if keyframe.is_none() => {
                    keyframe = Some(first.clone());
                }
                _ => timeline.push(event.clone()),
            }
        }
        let keyframe = keyframe.ok_or(ReplayError::MissingSnapshot)?;
        timeline.sort_by_key(|event| event.timestamp_ms);

        let total_duration_ms = total_duration_ms.unwrap_or_else(|| {
            timeline
                .iter()
                .rev()
                .find(|event| !event.is_snapshot())
                .map_or(0, |event| event.timestamp_ms)
        });

        surface
            .reconstruct(&keyframe)
            .map_err(|err| ReplayError::Reconstruction(err.to_string()))?;
        debug!(events = timeline.len(), total_duration_ms, "session loaded");

        let mut engine = Self {
            surface,
            keyframe,
            timeline,
            next: 0,
            clock_ms: 0.0,
            state: PlaybackState {
                total_duration_ms,
                current_time_ms: 0,
                speed_multiplier: 1.0,
                playing: false,
                cursor: Cursor {
                    x: 0.0,
                    y: 0.0,
                    visible: false,
                },
            },
            stats: ReplayStats::default(),
        };
        engine.apply_events_up_to(0);
        Ok(engine)
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn event_count(&self) -> usize {
        self.timeline.len()
    }

    /// Events applied so far in the current pass.
    pub fn applied_events(&self) -> &[SessionEvent] {
        &self.timeline[..self.next]
    }

    /// Apply every not yet applied event with `timestampMs <= t`, in order.
    /// Does not move the virtual clock. Returns how many events were
    /// consumed.
    pub fn apply_events_up_to(&mut self, t: u64) -> usize {
        let start = self.next;
        while let Some(event) = self.timeline.get(self.next) {
            if event.timestamp_ms > t {
                break;
            }
            let event = event.clone();
            self.next += 1;
            if let Err(err) = self.apply(&event) {
                warn!(error = %err, "skipping event that failed to apply");
                self.stats.failures += 1;
                self.stats.last_failure = Some(err);
            }
        }
        self.next - start
    }

    fn apply(&mut self, event: &SessionEvent) -> Result<(), ReplayError> {
        let failure = |reason: String| ReplayError::ApplyFailure {
            timestamp_ms: event.timestamp_ms,
            reason,
        };
        match &event.kind {
            EventKind::Pointer { x, y } => self.move_cursor(*x, *y),
            EventKind::Click { x, y, .. } => {
                self.move_cursor(*x, *y);
                self.surface.pulse(*x, *y);
            }
            EventKind::Scroll { x, y } => self
                .surface
                .set_scroll(*x, *y)
                .map_err(|err| failure(err.to_string()))?,
            EventKind::Mutation { ops } => {
                let mut failed = Vec::new();
                for op in ops {
                    if matches!(op, MutationOp::Error { .. } | MutationOp::Unknown { .. }) {
                        self.stats.skipped += 1;
                        continue;
                    }
                    if let Err(err) = self.surface.apply_mutation(op) {
                        warn!(timestamp_ms = event.timestamp_ms, error = %err, "mutation op skipped");
                        failed.push(err.to_string());
                    }
                }
                if !failed.is_empty() {
                    self.stats.applied += 1;
                    return Err(failure(failed.join("; ")));
                }
            }
            EventKind::Route { path } => self.surface.navigated(path),
            EventKind::Snapshot { keyframe } => {
                self.stats.resyncs += 1;
                self.surface
                    .reconstruct(keyframe)
                    .map_err(|err| failure(err.to_string()))?;
            }
            EventKind::Unknown { kind, .. } => {
                debug!(kind, "unknown event kind skipped");
                self.stats.skipped += 1;
                return Ok(());
            }
        }
        self.stats.applied += 1;
        Ok(())
    }

    fn move_cursor(&mut self, x: f64, y: f64) {
        self.state.cursor = Cursor {
            x,
            y,
            visible: true,
        };
    }

    /// Start playback. At the end of the timeline this is a no-op.
    pub fn play(&mut self) {
        if self.state.current_time_ms >= self.state.total_duration_ms {
            debug!("already at end of timeline");
            return;
        }
        self.state.playing = true;
    }

    pub fn pause(&mut self) {
        self.state.playing = false;
    }

    /// Advance virtual time by `delta_ms` while playing. Reaching the end
    /// clamps the clock and pauses.
    pub fn advance(&mut self, delta_ms: f64) {
        if !self.state.playing {
            return;
        }
        let total = self.state.total_duration_ms as f64;
        self.clock_ms = (self.clock_ms + delta_ms.max(0.0)).min(total);
        self.state.current_time_ms = self.clock_ms as u64;
        self.apply_events_up_to(self.state.current_time_ms);
        if self.state.current_time_ms >= self.state.total_duration_ms {
            self.state.playing = false;
            debug!("end of timeline reached");
        }
    }

    /// One playback tick: [`TICK`] scaled by the speed multiplier.
    pub fn tick(&mut self) {
        self.advance(TICK.as_millis() as f64 * self.state.speed_multiplier);
    }

    /// Rebuild the surface from the keyframe and replay everything up to
    /// `target_ms`, clamped to the timeline. Playing state is preserved.
    #[instrument(skip(self), fields(total = self.state.total_duration_ms))]
    pub fn seek(&mut self, target_ms: u64) -> Result<(), ReplayError> {
        let target = target_ms.min(self.state.total_duration_ms);
        self.surface
            .reconstruct(&self.keyframe)
            .map_err(|err| ReplayError::Reconstruction(err.to_string()))?;
        self.next = 0;
        self.stats = ReplayStats::default();
        self.state.cursor = Cursor {
            x: 0.0,
            y: 0.0,
            visible: false,
        };
        self.apply_events_up_to(target);
        self.clock_ms = target as f64;
        self.state.current_time_ms = target;
        if target >= self.state.total_duration_ms {
            self.state.playing = false;
        }
        debug!(target, applied = self.next, "seek complete");
        Ok(())
    }

    /// Affects subsequent ticks only.
    pub fn set_speed(&mut self, multiplier: f64) -> Result<(), ReplayError> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(ReplayError::InvalidSpeed(multiplier));
        }
        self.state.speed_multiplier = multiplier;
        Ok(())
    }
}
