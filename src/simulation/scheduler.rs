//! Fixed-timestep scheduler
//!
//! Converts elapsed wall time into a whole number of engine steps. Wall time
//! scaled by the rate accumulates as step debt in units of the engine
//! timestep; each tick pays off as much of it as the per-tick ceiling allows.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Scrubbing,
}

/// Bounds the scheduler enforces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerLimits {
    /// Longest wall gap a single tick accounts for
    pub max_wall_delta: Duration,
    /// Per-tick step ceiling
    pub max_steps: u32,
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_wall_delta: Duration::from_millis(250),
            max_steps: 240,
            min_rate: 1.0 / 16.0,
            max_rate: 16.0,
        }
    }
}

/// Work for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickPlan {
    pub steps: u32,
    /// Wall seconds this tick accounts for, after clamping
    pub wall_delta: f64,
}

const SLOWDOWN_ALPHA: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct StepScheduler {
    state: RunState,
    limits: SchedulerLimits,
    rate: f64,
    step_debt: f64,
    baseline: Option<Duration>,
    measured_slowdown: Option<f64>,
}

impl StepScheduler {
    pub fn new(limits: SchedulerLimits) -> Self {
        Self {
            state: RunState::Idle,
            limits,
            rate: 1.0,
            step_debt: 0.0,
            baseline: None,
            measured_slowdown: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_scrubbing(&self) -> bool {
        self.state == RunState::Scrubbing
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn step_debt(&self) -> f64 {
        self.step_debt
    }

    /// Smoothed ratio of requested to achieved sim time; 1.0 before the
    /// first measurement
    pub fn measured_slowdown(&self) -> f64 {
        self.measured_slowdown.unwrap_or(1.0)
    }

    /// Forget the wall baseline and any accumulated debt
    pub fn reset_baseline(&mut self) {
        self.baseline = None;
        self.step_debt = 0.0;
    }

    /// Start or stop stepping. Ignored while scrubbing.
    pub fn set_running(&mut self, running: bool) -> bool {
        if self.state == RunState::Scrubbing {
            return false;
        }
        let next = if running { RunState::Running } else { RunState::Idle };
        if next != self.state {
            debug!("scheduler {:?} -> {:?}", self.state, next);
            self.state = next;
            self.reset_baseline();
        }
        true
    }

    /// Stop from any state, including scrubbing
    pub fn force_idle(&mut self) {
        self.state = RunState::Idle;
        self.reset_baseline();
    }

    /// Stop stepping for history browsing. Returns the state to restore on
    /// release.
    pub fn enter_scrub(&mut self) -> RunState {
        let prior = self.state;
        self.state = RunState::Scrubbing;
        self.reset_baseline();
        prior
    }

    /// Leave scrubbing, resuming if `resume`. No-op when not scrubbing.
    pub fn release_scrub(&mut self, resume: bool) {
        if self.state != RunState::Scrubbing {
            return;
        }
        self.state = if resume { RunState::Running } else { RunState::Idle };
        self.reset_baseline();
    }

    /// Clamp and apply a rate multiplier, returning the applied value
    pub fn set_rate(&mut self, rate: f64) -> f64 {
        let rate = if rate.is_finite() { rate } else { 1.0 };
        self.rate = rate.clamp(self.limits.min_rate, self.limits.max_rate);
        self.reset_baseline();
        self.rate
    }

    /// Accumulate debt for the wall time since the previous tick.
    ///
    /// Returns `None` when not running, on the first tick after a baseline
    /// reset, or when `dt` is unusable.
    pub fn plan(&mut self, now: Duration, dt: f64) -> Option<TickPlan> {
        if self.state != RunState::Running || !(dt.is_finite() && dt > 0.0) {
            self.baseline = Some(now);
            return None;
        }
        let Some(previous) = self.baseline.replace(now) else {
            return None;
        };
        let wall_delta = now.saturating_sub(previous).min(self.limits.max_wall_delta).as_secs_f64();
        self.step_debt += wall_delta * self.rate / dt;
        let steps = if self.step_debt > 0.0 {
            (self.step_debt.floor() as u64).min(self.limits.max_steps as u64) as u32
        } else {
            0
        };
        Some(TickPlan { steps, wall_delta })
    }

    /// Settle a tick. Planned steps are paid off even if fewer ran, so a
    /// failure is never retried within the debt.
    pub fn commit(&mut self, plan: TickPlan, sim_advanced: f64) {
        self.step_debt = (self.step_debt - plan.steps as f64).max(0.0);
        let requested = plan.wall_delta * self.rate;
        if sim_advanced > 0.0 && requested > 0.0 {
            let instant = requested / sim_advanced;
            if instant.is_finite() && instant > 0.0 {
                self.measured_slowdown = Some(match self.measured_slowdown {
                    Some(prev) => prev * (1.0 - SLOWDOWN_ALPHA) + instant * SLOWDOWN_ALPHA,
                    None => instant,
                });
            }
        }
    }
}

impl Default for StepScheduler {
    fn default() -> Self {
        Self::new(SchedulerLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.002;

    fn running() -> StepScheduler {
        let mut scheduler = StepScheduler::default();
        scheduler.set_running(true);
        assert!(scheduler.plan(Duration::ZERO, DT).is_none());
        scheduler
    }

    fn run(scheduler: &mut StepScheduler, from_ms: u64, ticks: u64, every_ms: u64) -> u64 {
        let mut total = 0;
        for i in 1..=ticks {
            let now = Duration::from_millis(from_ms + i * every_ms);
            if let Some(plan) = scheduler.plan(now, DT) {
                scheduler.commit(plan, plan.steps as f64 * DT);
                total += plan.steps as u64;
            }
        }
        total
    }

    #[test]
    fn test_idle_accumulates_nothing() {
        let mut scheduler = StepScheduler::default();
        assert!(scheduler.plan(Duration::from_secs(3), DT).is_none());
        assert_eq!(scheduler.step_debt(), 0.0);
    }

    #[test]
    fn test_real_time_step_count() {
        let mut scheduler = running();
        // one second of 8 ms ticks at dt = 2 ms
        let steps = run(&mut scheduler, 0, 125, 8);
        assert!((499..=500).contains(&steps), "{steps}");
    }

    #[test]
    fn test_long_gap_hits_ceiling() {
        let mut scheduler = running();
        let plan = scheduler.plan(Duration::from_secs(10), DT).unwrap();
        assert_eq!(plan.wall_delta, 0.25);
        assert!((124..=125).contains(&plan.steps));

        let mut fast = running();
        fast.set_rate(16.0);
        fast.plan(Duration::from_secs(20), DT);
        let plan = fast.plan(Duration::from_secs(30), DT).unwrap();
        assert_eq!(plan.steps, 240);
    }

    #[test]
    fn test_rate_scales_steps() {
        let mut normal = running();
        let base = run(&mut normal, 0, 125, 8);
        let mut double = running();
        double.set_rate(2.0);
        double.plan(Duration::ZERO, DT);
        let twice = run(&mut double, 0, 125, 8);
        assert!((twice as i64 - 2 * base as i64).abs() <= 2, "{base} vs {twice}");
    }

    #[test]
    fn test_jittered_ticks_keep_real_time() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut scheduler = running();
        let (mut now_ms, mut total) = (0u64, 0u64);
        while now_ms < 2000 {
            now_ms += rng.random_range(1..=20);
            if let Some(plan) = scheduler.plan(Duration::from_millis(now_ms), DT) {
                scheduler.commit(plan, plan.steps as f64 * DT);
                total += plan.steps as u64;
            }
        }
        // whole steps only, so at most one step of debt is outstanding
        let expected = now_ms as f64 / 1000.0 / DT;
        assert!((expected - total as f64).abs() < 1.5, "{expected} vs {total}");
    }

    #[test]
    fn test_rate_is_clamped() {
        let mut scheduler = StepScheduler::default();
        assert_eq!(scheduler.set_rate(100.0), 16.0);
        assert_eq!(scheduler.set_rate(0.0), 1.0 / 16.0);
        assert_eq!(scheduler.set_rate(f64::NAN), 1.0);
    }

    #[test]
    fn test_scrub_blocks_running_until_release() {
        let mut scheduler = running();
        assert_eq!(scheduler.enter_scrub(), RunState::Running);
        assert!(!scheduler.set_running(true));
        assert!(scheduler.plan(Duration::from_secs(1), DT).is_none());
        scheduler.release_scrub(true);
        assert!(scheduler.is_running());
        // fresh baseline after release
        assert!(scheduler.plan(Duration::from_secs(2), DT).is_none());
    }

    #[test]
    fn test_slowdown_tracks_shortfall() {
        let mut scheduler = running();
        for i in 1..=200 {
            let plan = scheduler.plan(Duration::from_millis(i * 8), DT).unwrap();
            // the engine only manages half the requested sim time
            scheduler.commit(plan, plan.wall_delta * 0.5);
        }
        assert!((scheduler.measured_slowdown() - 2.0).abs() < 1e-6);
    }
}
