//! # Tick timing
//!
//! Wall-clock cost of the session's stepping ticks, kept in a bounded ring
//! for the `info` block of each snapshot.
//!
//! ```rust
//! use std::time::Duration;
//! use forgebridge::performance::TickMonitor;
//!
//! let mut monitor = TickMonitor::new();
//! monitor.record(Duration::from_millis(2));
//! monitor.record(Duration::from_millis(4));
//! assert_eq!(monitor.metrics().max_tick_ms, 4.0);
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Summary of recent tick durations
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickMetrics {
    pub avg_tick_ms: f64,
    pub min_tick_ms: f64,
    pub max_tick_ms: f64,
    /// Steps executed by the most recent tick
    pub last_steps: u32,
    pub samples: usize,
}

pub struct TickMonitor {
    /// Ring buffer of recent tick durations
    tick_times: VecDeque<Duration>,
    max_samples: usize,
    tick_start: Option<Instant>,
    last_steps: u32,
}

impl TickMonitor {
    pub fn new() -> Self {
        Self::with_capacity(120)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            tick_times: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            tick_start: None,
            last_steps: 0,
        }
    }

    /// Mark the beginning of a tick
    pub fn begin_tick(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// Mark the end of a tick that ran `steps` engine steps
    pub fn end_tick(&mut self, steps: u32) {
        if let Some(start) = self.tick_start.take() {
            self.record(start.elapsed());
            self.last_steps = steps;
        }
    }

    pub fn record(&mut self, tick_time: Duration) {
        if self.tick_times.len() >= self.max_samples {
            self.tick_times.pop_front();
        }
        self.tick_times.push_back(tick_time);
    }

    pub fn metrics(&self) -> TickMetrics {
        if self.tick_times.is_empty() {
            return TickMetrics {
                last_steps: self.last_steps,
                ..TickMetrics::default()
            };
        }
        let ms = |d: &Duration| d.as_secs_f64() * 1000.0;
        let total: Duration = self.tick_times.iter().sum();
        TickMetrics {
            avg_tick_ms: ms(&total) / self.tick_times.len() as f64,
            min_tick_ms: self.tick_times.iter().min().map_or(0.0, ms),
            max_tick_ms: self.tick_times.iter().max().map_or(0.0, ms),
            last_steps: self.last_steps,
            samples: self.tick_times.len(),
        }
    }

    /// Tick history in milliseconds, oldest first
    pub fn history_ms(&self) -> Vec<f64> {
        self.tick_times.iter().map(|d| d.as_secs_f64() * 1000.0).collect()
    }

    pub fn reset(&mut self) {
        self.tick_times.clear();
        self.tick_start = None;
        self.last_steps = 0;
    }
}

impl Default for TickMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let mut monitor = TickMonitor::with_capacity(3);
        for ms in [10, 1, 2, 3] {
            monitor.record(Duration::from_millis(ms));
        }
        let metrics = monitor.metrics();
        assert_eq!(metrics.samples, 3);
        assert_eq!(metrics.max_tick_ms, 3.0);
        assert_eq!(metrics.min_tick_ms, 1.0);
        assert!((metrics.avg_tick_ms - 2.0).abs() < 1e-9);
        assert_eq!(monitor.history_ms().len(), 3);
    }

    #[test]
    fn test_begin_end_records_steps() {
        let mut monitor = TickMonitor::new();
        monitor.end_tick(7);
        assert_eq!(monitor.metrics().samples, 0);
        monitor.begin_tick();
        monitor.end_tick(7);
        assert_eq!(monitor.metrics().last_steps, 7);
        monitor.reset();
        assert_eq!(monitor.metrics(), TickMetrics::default());
    }
}
