//! Simulation time
//!
//! Variable wall-clock deltas for `update`, plus a fixed 60Hz step for
//! `fixed_update`.

use std::time::{Duration, Instant};

/// Fixed simulation tick rate (60 Hz = 16.666ms per tick)
pub const TICK_RATE_HZ: u32 = 60;
pub const TICK_DURATION: Duration = Duration::from_micros(16_666); // ~16.666ms
pub const TICK_DURATION_SECS: f32 = 1.0 / TICK_RATE_HZ as f32;

/// Measures wall time between consecutive ticks.
///
/// Deltas are clamped to `max_delta` so a thread that was blocked for a long
/// time (debugger, suspended window) does not feed a huge step into the
/// simulation.
pub struct DeltaClock {
    last: Instant,
    max_delta: Duration,
}

impl DeltaClock {
    pub fn new(max_delta: Duration) -> Self {
        Self {
            last: Instant::now(),
            max_delta,
        }
    }

    /// Time since the previous call (or construction), clamped.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        elapsed.min(self.max_delta)
    }
}

/// Fixed-step accumulator driving `fixed_update`.
pub struct FixedStep {
    tick_count: u64,
    accumulated: Duration,
    max_steps: u32,
}

impl FixedStep {
    pub fn new(max_steps: u32) -> Self {
        Self {
            tick_count: 0,
            accumulated: Duration::ZERO,
            max_steps: max_steps.max(1),
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Feed a frame delta and return how many fixed ticks are due.
    ///
    /// At most `max_steps` ticks are returned per call; any backlog beyond
    /// that is dropped rather than carried forward.
    pub fn advance(&mut self, delta: Duration) -> u32 {
        self.accumulated += delta;
        let mut steps = 0;
        while self.accumulated >= TICK_DURATION && steps < self.max_steps {
            self.accumulated -= TICK_DURATION;
            steps += 1;
        }
        if steps == self.max_steps && self.accumulated >= TICK_DURATION {
            self.accumulated = Duration::ZERO;
        }
        self.tick_count += u64::from(steps);
        steps
    }

    pub fn total_time(&self) -> Duration {
        TICK_DURATION.mul_f64(self.tick_count as f64)
    }
}

impl Default for FixedStep {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_step_accumulates() {
        let mut step = FixedStep::new(5);
        assert_eq!(step.advance(Duration::from_millis(10)), 0);
        assert_eq!(step.advance(Duration::from_millis(10)), 1);
        assert_eq!(step.tick_count(), 1);
        assert_eq!(step.advance(TICK_DURATION * 2), 2);
        assert_eq!(step.tick_count(), 3);
    }

    #[test]
    fn test_fixed_step_drops_backlog() {
        let mut step = FixedStep::new(3);
        assert_eq!(step.advance(Duration::from_secs(1)), 3);
        // Backlog beyond max_steps is discarded
        assert_eq!(step.advance(Duration::ZERO), 0);
    }

    #[test]
    fn test_delta_clock_clamps() {
        let mut clock = DeltaClock::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.tick(), Duration::from_millis(1));
    }
}
