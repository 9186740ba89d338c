use std::sync::Arc;

use parking_lot::Mutex;
use tapedeck_protocol::{RenderSurface, ReplayError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::engine::{PlaybackState, ReplayEngine, ReplayStats, TICK};

/// Real-time driver for a [`ReplayEngine`].
///
/// The engine sits behind one async mutex, so the tick task and `seek`
/// never interleave. State changes are published on a watch channel.
pub struct ReplayPlayer<S> {
    engine: Arc<tokio::sync::Mutex<ReplayEngine<S>>>,
    states: watch::Sender<PlaybackState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RenderSurface + 'static> ReplayPlayer<S> {
    pub fn new(engine: ReplayEngine<S>) -> Self {
        let (states, _) = watch::channel(engine.state().clone());
        Self {
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            states,
            ticker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.states.subscribe()
    }

    pub async fn state(&self) -> PlaybackState {
        self.engine.lock().await.state().clone()
    }

    pub async fn stats(&self) -> ReplayStats {
        self.engine.lock().await.stats().clone()
    }

    /// Run `f` against the surface under the engine lock.
    pub async fn with_surface<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.engine.lock().await.surface())
    }

    pub async fn play(&self) {
        let mut engine = self.engine.lock().await;
        engine.play();
        self.states.send_replace(engine.state().clone());
        if engine.state().playing {
            self.ensure_ticker();
        }
    }

    pub async fn pause(&self) {
        self.stop_ticker();
        let mut engine = self.engine.lock().await;
        engine.pause();
        self.states.send_replace(engine.state().clone());
    }

    pub async fn seek(&self, target_ms: u64) -> Result<(), ReplayError> {
        let mut engine = self.engine.lock().await;
        let result = engine.seek(target_ms);
        self.states.send_replace(engine.state().clone());
        result
    }

    pub async fn set_speed(&self, multiplier: f64) -> Result<(), ReplayError> {
        let mut engine = self.engine.lock().await;
        engine.set_speed(multiplier)?;
        self.states.send_replace(engine.state().clone());
        Ok(())
    }

    /// Halt the tick and hand back the engine's final state. Virtual time
    /// not yet applied is discarded.
    pub async fn stop(&self) -> PlaybackState {
        self.stop_ticker();
        let mut engine = self.engine.lock().await;
        engine.pause();
        let state = engine.state().clone();
        self.states.send_replace(state.clone());
        state
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let engine = self.engine.clone();
        let states = self.states.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut engine = engine.lock().await;
                engine.tick();
                let state = engine.state().clone();
                let playing = state.playing;
                states.send_replace(state);
                if !playing {
                    debug!("playback paused, tick task exiting");
                    break;
                }
            }
        }));
    }
}

impl<S> Drop for ReplayPlayer<S> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}
