//! Session configuration
//!
//! ```rust
//! use std::time::Duration;
//! use forgebridge::config::SessionConfig;
//!
//! let config = SessionConfig::default()
//!     .with_history(60.0, 1200)
//!     .with_tick_interval(Duration::from_millis(4))
//!     .with_verbose_events(true);
//! assert_eq!(config.history_capacity, 1200);
//! ```

use std::time::Duration;

use crate::simulation::history::HistoryLimits;
use crate::simulation::scheduler::SchedulerLimits;
use crate::simulation::state::StateSignature;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Period of the stepping tick
    pub tick_interval: Duration,
    /// Period of the snapshot broadcast
    pub snapshot_interval: Duration,
    pub scheduler: SchedulerLimits,
    pub history_hz: f64,
    pub history_capacity: usize,
    pub history_limits: HistoryLimits,
    /// State components recorded by history and keyframes
    pub signature: StateSignature,
    pub user_keyframe_slots: usize,
    /// Upper bound for an explicit `step` command
    pub max_step_command: u32,
    /// Models with more generalized coordinates ship snapshots without qpos
    pub qpos_snapshot_limit: usize,
    /// Forward diagnostic `log` events to the consumer
    pub verbose_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(8),
            snapshot_interval: Duration::from_millis(16),
            scheduler: SchedulerLimits::default(),
            history_hz: 30.0,
            history_capacity: 900,
            history_limits: HistoryLimits::default(),
            signature: StateSignature::INTEGRATION,
            user_keyframe_slots: 5,
            max_step_command: 10_000,
            qpos_snapshot_limit: 512,
            verbose_events: false,
        }
    }
}

impl SessionConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_scheduler_limits(mut self, limits: SchedulerLimits) -> Self {
        self.scheduler = limits;
        self
    }

    pub fn with_history(mut self, capture_hz: f64, capacity: usize) -> Self {
        self.history_hz = capture_hz;
        self.history_capacity = capacity;
        self
    }

    pub fn with_history_limits(mut self, limits: HistoryLimits) -> Self {
        self.history_limits = limits;
        self
    }

    pub fn with_signature(mut self, signature: StateSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_user_keyframe_slots(mut self, slots: usize) -> Self {
        self.user_keyframe_slots = slots;
        self
    }

    pub fn with_qpos_snapshot_limit(mut self, limit: usize) -> Self {
        self.qpos_snapshot_limit = limit;
        self
    }

    pub fn with_verbose_events(mut self, verbose: bool) -> Self {
        self.verbose_events = verbose;
        self
    }
}
