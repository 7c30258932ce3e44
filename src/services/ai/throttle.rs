use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Repaint cadence for the window that owns the turn.
pub const REPAINT_INTERVAL: Duration = Duration::from_millis(16);
/// Cadence of mirror writes to other windows while streaming.
pub const MIRROR_INTERVAL: Duration = Duration::from_millis(1000);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.start + offset
    }
}

/// Leading-edge throttle with a coalescing trailing update.
///
/// `request` fires immediately when the interval has elapsed; otherwise the
/// update is marked pending and fires from `poll` once due, or from `flush`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: false,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_emit
            .map(|last| now.saturating_duration_since(last) >= self.interval)
            .unwrap_or(true)
    }

    pub fn request(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.last_emit = Some(now);
            self.pending = false;
            true
        } else {
            self.pending = true;
            false
        }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        if self.pending && self.is_due(now) {
            self.last_emit = Some(now);
            self.pending = false;
            true
        } else {
            false
        }
    }

    /// When a deferred update becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        self.last_emit.map(|last| last + self.interval)
    }

    pub fn flush(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_fires_and_burst_coalesces() {
        let clock = ManualClock::default();
        let mut throttle = Throttle::new(REPAINT_INTERVAL);

        assert!(throttle.request(clock.now()));
        clock.advance(Duration::from_millis(5));
        assert!(!throttle.request(clock.now()));
        assert!(!throttle.request(clock.now()));
        assert!(throttle.is_pending());
        assert_eq!(
            throttle.deadline(),
            Some(clock.now() + Duration::from_millis(11))
        );

        clock.advance(Duration::from_millis(5));
        assert!(!throttle.poll(clock.now()));
        clock.advance(Duration::from_millis(6));
        assert!(throttle.poll(clock.now()));
        assert!(!throttle.poll(clock.now()));
        assert_eq!(throttle.deadline(), None);
    }

    #[test]
    fn flush_releases_deferred_update_once() {
        let clock = ManualClock::default();
        let mut throttle = Throttle::new(MIRROR_INTERVAL);
        assert!(throttle.request(clock.now()));
        clock.advance(Duration::from_millis(100));
        assert!(!throttle.request(clock.now()));
        assert!(throttle.flush());
        assert!(!throttle.flush());
    }

    #[test]
    fn request_after_interval_fires_immediately() {
        let clock = ManualClock::default();
        let mut throttle = Throttle::new(MIRROR_INTERVAL);
        assert!(throttle.request(clock.now()));
        clock.advance(MIRROR_INTERVAL);
        assert!(throttle.request(clock.now()));
    }
}
