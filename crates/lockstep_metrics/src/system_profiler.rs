//! Named timings for simulation stages

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Default, Clone, Copy)]
struct Timing {
    total: Duration,
    calls: u64,
}

pub struct SystemProfiler {
    timings: HashMap<String, Timing>,
}

impl SystemProfiler {
    pub fn new() -> Self {
        Self {
            timings: HashMap::new(),
        }
    }

    pub fn time_system<F, R>(&mut self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        let timing = self.timings.entry(name.to_string()).or_default();
        timing.total += elapsed;
        timing.calls += 1;
        result
    }

    /// Accumulated time spent in `name`.
    pub fn get_timing(&self, name: &str) -> Duration {
        self.timings.get(name).map(|t| t.total).unwrap_or(Duration::ZERO)
    }

    pub fn calls(&self, name: &str) -> u64 {
        self.timings.get(name).map(|t| t.calls).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.timings.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Duration, u64)> {
        self.timings
            .iter()
            .map(|(name, t)| (name.as_str(), t.total, t.calls))
    }
}

impl Default for SystemProfiler {
    fn default() -> Self {
        Self::new()
    }
}
