//! Playback clock
//!
//! Decoders report the span of media time that is audible or visible; the
//! interpolator advances inside that span with wall time so callers see a
//! smooth position between reports.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall clock used by the interpolator
pub trait TimeSource: Send {
    fn now(&self) -> Instant;
}

/// The monotonic system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    now: Arc<Mutex<Instant>>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.now.lock() += delta;
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Media time interpolated between decoder reports
pub struct TimeInterpolator {
    source: Box<dyn TimeSource>,
    interpolating: bool,
    lower: Duration,
    upper: Option<Duration>,
    reference: Instant,
}

impl TimeInterpolator {
    pub fn new(source: Box<dyn TimeSource>) -> Self {
        let reference = source.now();
        Self {
            source,
            interpolating: false,
            lower: Duration::ZERO,
            upper: None,
            reference,
        }
    }

    pub fn interpolating(&self) -> bool {
        self.interpolating
    }

    pub fn start_interpolating(&mut self) {
        self.interpolating = true;
        self.reference = self.source.now();
    }

    /// Freeze the clock at its current value and return it
    pub fn stop_interpolating(&mut self) -> Duration {
        let current = self.current_time();
        self.interpolating = false;
        self.lower = current;
        current
    }

    /// Restart interpolation from `lower`, never passing `upper`
    pub fn set_bounds(&mut self, lower: Duration, upper: Duration) {
        self.lower = lower;
        self.upper = Some(upper.max(lower));
        self.reference = self.source.now();
    }

    /// Drop the upper bound and pin the clock to `time`
    pub fn reset(&mut self, time: Duration) {
        self.lower = time;
        self.upper = None;
        self.reference = self.source.now();
    }

    pub fn current_time(&self) -> Duration {
        if !self.interpolating {
            return self.lower;
        }
        let elapsed = self.source.now().saturating_duration_since(self.reference);
        let time = self.lower + elapsed;
        match self.upper {
            Some(upper) => time.min(upper),
            None => time,
        }
    }
}

impl std::fmt::Debug for TimeInterpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeInterpolator")
            .field("interpolating", &self.interpolating)
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .finish()
    }
}
