//! Progress reporting decoupled from I/O cadence. Transfers call
//! [`ProgressTracker::advance`] as often as they like; events only reach the
//! subscriber at most once per throttle interval.

mod format;
mod render;
mod speed;

use std::time::Duration;

use tokio::{
    sync::mpsc,
    time::Instant,
};

pub use format::{BinarySize, ClockDuration, Eta};
pub use render::{ProgressRenderer, RenderMode};
pub use speed::ProgressSpeed;

/// Window for the moving average speed.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Snapshot of a transfer, as seen by a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub label: String,
    pub position: u64,
    /// `None` if the total is not known (eg. no `Content-Length`)
    pub length: Option<u64>,
    pub bytes_per_sec: u64,
    pub elapsed: Duration,
    /// Set on the final event of a transfer
    pub finished: bool,
}

impl ProgressEvent {
    /// Estimated time until `length` is reached at the current speed.
    pub fn eta(&self) -> Option<Duration> {
        let length = self.length?;
        if self.bytes_per_sec == 0 {
            return None;
        }

        Some(Duration::from_secs(length.saturating_sub(self.position) / self.bytes_per_sec))
    }
}

/// Lets through at most one tick per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a report may happen at `now`. The first call always passes.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(t) if now.saturating_duration_since(t) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Handle for creating trackers that publish to one subscriber.
#[derive(Clone, Debug)]
pub struct ProgressSender(Option<mpsc::UnboundedSender<ProgressEvent>>);

impl ProgressSender {
    /// Sender whose trackers count progress but publish nothing.
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn tracker(&self, label: &str, length: Option<u64>, interval: Duration) -> ProgressTracker {
        let now = Instant::now();

        ProgressTracker {
            label: label.to_owned(),
            length,
            position: 0,
            started: now,
            throttle: Throttle::new(interval),
            speed: ProgressSpeed::new(SPEED_WINDOW),
            tx: self.0.clone(),
        }
    }
}

/// Create a connected sender and receiver.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender(Some(tx)), rx)
}

/// Counts the progress of one transfer and publishes throttled events.
#[derive(Debug)]
pub struct ProgressTracker {
    label: String,
    length: Option<u64>,
    position: u64,
    started: Instant,
    throttle: Throttle,
    speed: ProgressSpeed,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressTracker {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn set_length(&mut self, length: Option<u64>) {
        self.length = length;
    }

    pub fn set_label(&mut self, label: &str) {
        label.clone_into(&mut self.label);
    }

    /// Add `delta` units. Returns whether an event was published.
    pub fn advance(&mut self, delta: u64) -> bool {
        let now = Instant::now();

        self.position = self.position.saturating_add(delta);
        self.speed.record(now, self.position);

        if self.throttle.ready(now) {
            self.publish(now, false);
            true
        } else {
            false
        }
    }

    /// Publish the final event, bypassing the throttle.
    pub fn finish(&mut self) {
        let now = Instant::now();
        self.speed.record(now, self.position);
        self.publish(now, true);
    }

    fn publish(&self, now: Instant, finished: bool) {
        if let Some(tx) = &self.tx {
            // Nobody listening is fine
            let _ = tx.send(ProgressEvent {
                label: self.label.clone(),
                position: self.position,
                length: self.length,
                bytes_per_sec: self.speed.units_per_sec() as u64,
                elapsed: now.saturating_duration_since(self.started),
                finished,
            });
        }
    }
}
