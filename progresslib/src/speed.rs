use std::{
    collections::VecDeque,
    time::Duration,
};

use tokio::time::Instant;

/// Samples closer together than this are merged into one
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Moving average of progress over a sliding time window.
#[derive(Debug)]
pub struct ProgressSpeed {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressSpeed {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the absolute progress value at `now`. One sample older than the
    /// window is kept so the average always spans the full window. If the
    /// sample before the newest one is less than [`MIN_SAMPLE_INTERVAL`] old,
    /// the newest one is replaced instead of adding another.
    pub fn record(&mut self, now: Instant, value: u64) {
        let len = self.samples.len();
        let recent = len >= 2 && now.duration_since(self.samples[len - 2].0) < MIN_SAMPLE_INTERVAL;

        match self.samples.back_mut() {
            Some(last) if recent => *last = (now, value),
            _ => self.samples.push_back((now, value)),
        }

        let stale = self.samples.iter()
            .position(|(t, _)| now.duration_since(*t) < self.window)
            .and_then(|i| i.checked_sub(1));
        if let Some(n) = stale {
            self.samples.drain(..n);
        }
    }

    /// Units per second over the window, or 0 without enough samples.
    pub fn units_per_sec(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) if last.0 > first.0 => {
                last.1.saturating_sub(first.1) as f64 / (last.0 - first.0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}
