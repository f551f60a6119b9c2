//! Render pass timing

use super::ring_buffer::RingBuffer;
use std::time::{Duration, Instant};

/// Opaque start marker returned by [`FrameTimer::begin`].
#[derive(Debug, Clone, Copy)]
pub struct PassStart(Instant);

pub struct FrameTimer {
    frame_times: RingBuffer<Duration>,
    last_end: Option<Instant>,
    intervals: RingBuffer<Duration>,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frame_times: RingBuffer::new(capacity),
            last_end: None,
            intervals: RingBuffer::new(capacity),
        }
    }

    pub fn begin(&self) -> PassStart {
        PassStart(Instant::now())
    }

    pub fn end(&mut self, start: PassStart) {
        let now = Instant::now();
        self.frame_times.push(now.duration_since(start.0));
        if let Some(last) = self.last_end.replace(now) {
            self.intervals.push(now.duration_since(last));
        }
    }

    /// Passes per second, measured end-to-end between consecutive passes.
    pub fn fps(&self) -> f64 {
        let avg = self.intervals.average();
        if avg.as_secs_f64() > 0.0 {
            1.0 / avg.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Average time spent inside a pass.
    pub fn frame_time_ms(&self) -> f64 {
        self.frame_times.average().as_secs_f64() * 1000.0
    }

    pub fn frame_time_range_ms(&self) -> (f64, f64) {
        let (min, max) = self.frame_times.min_max();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }

    pub fn samples(&self) -> usize {
        self.frame_times.len()
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(120)
    }
}
