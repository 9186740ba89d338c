use std::time::Duration;

/// Drop-latest rate limiter for high-frequency signals.
///
/// The first signal after a quiet period opens a window of `period`. Every
/// signal inside the window overwrites the held sample; only the latest one
/// survives. The held sample is released when the next window opens or on
/// [`Sampler::drain`]. A drain spends the current window: signals that
/// arrive before it ends are dropped. Memory is one sample, output is at
/// most one sample per window.
#[derive(Debug, Clone)]
pub struct Sampler<T> {
    period_ms: u64,
    window_end: Option<u64>,
    spent: bool,
    pending: Option<(u64, T)>,
}

impl<T> Sampler<T> {
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: (period.as_millis() as u64).max(1),
            window_end: None,
            spent: false,
            pending: None,
        }
    }

    /// Offer a signal observed at `now_ms`. Returns the sample of the window
    /// this signal closed, if any.
    pub fn offer(&mut self, now_ms: u64, value: T) -> Option<(u64, T)> {
        match self.window_end {
            Some(end) if now_ms < end => {
                if !self.spent {
                    self.pending = Some((now_ms, value));
                }
                None
            }
            _ => {
                let closed = self.pending.take();
                self.window_end = Some(now_ms + self.period_ms);
                self.spent = false;
                self.pending = Some((now_ms, value));
                closed
            }
        }
    }

    /// Release the held sample, if any, and close the current window.
    pub fn drain(&mut self) -> Option<(u64, T)> {
        let drained = self.pending.take();
        if drained.is_some() {
            self.spent = true;
        }
        drained
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(period_ms: u64, signals: impl IntoIterator<Item = u64>) -> Vec<(u64, u64)> {
        let mut sampler = Sampler::new(Duration::from_millis(period_ms));
        let mut out = Vec::new();
        for ts in signals {
            out.extend(sampler.offer(ts, ts));
        }
        out.extend(sampler.drain());
        out
    }

    #[test]
    fn keeps_only_latest_signal_per_window() {
        let out = run(50, [0, 10, 20, 49, 60, 70]);
        assert_eq!(out, vec![(49, 49), (70, 70)]);
    }

    #[test]
    fn output_is_bounded_under_flooding() {
        for (period, window) in [(50_u64, 1_000_u64), (100, 1_000), (50, 5_000), (100, 333)] {
            let out = run(period, 0..window);
            let bound = window.div_ceil(period) + 1;
            assert!(
                out.len() as u64 <= bound,
                "period {period} window {window}: {} > {bound}",
                out.len()
            );
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn sparse_signals_pass_through() {
        let out = run(100, [0, 250, 600]);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn drain_empties_the_sampler() {
        let mut sampler = Sampler::new(Duration::from_millis(50));
        assert!(sampler.offer(5, "a").is_none());
        assert!(sampler.has_pending());
        assert_eq!(sampler.drain(), Some((5, "a")));
        assert!(sampler.drain().is_none());
    }

    #[test]
    fn drain_mid_window_spends_the_window() {
        let mut sampler = Sampler::new(Duration::from_millis(50));
        let mut out = Vec::new();
        for ts in 0..75 {
            out.extend(sampler.offer(ts, ts));
        }
        out.extend(sampler.drain());
        for ts in 75..100 {
            out.extend(sampler.offer(ts, ts));
        }
        out.extend(sampler.drain());
        assert_eq!(out, vec![(49, 49), (74, 74)]);

        out.extend(sampler.offer(100, 100));
        out.extend(sampler.drain());
        assert_eq!(out.last(), Some(&(100, 100)));
    }

    #[test]
    fn frequent_drains_keep_output_bounded() {
        let period = 50_u64;
        let window = 1_000_u64;
        let mut sampler = Sampler::new(Duration::from_millis(period));
        let mut out = Vec::new();
        for ts in 0..window {
            out.extend(sampler.offer(ts, ts));
            if ts % 30 == 29 {
                out.extend(sampler.drain());
            }
        }
        out.extend(sampler.drain());
        assert!(out.len() as u64 <= window.div_ceil(period) + 1, "{}", out.len());
        assert!(out.windows(2).all(|pair| pair[1].0 / period > pair[0].0 / period));
    }
}
