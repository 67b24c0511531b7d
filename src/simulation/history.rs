//! Rewindable ring of captured states

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use super::handle::{ModelStamp, SimulationHandle};
use super::scheduler::{RunState, StepScheduler};
use super::state::{StateBuffer, StateSignature};
use super::SimError;
use crate::bridge::HeapBridge;

/// Clamps for history configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryLimits {
    pub min_hz: f64,
    pub max_hz: f64,
    pub min_capacity: usize,
    pub max_capacity: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            min_hz: 5.0,
            max_hz: 240.0,
            min_capacity: 32,
            max_capacity: 3600,
        }
    }
}

/// Wire form of the buffer's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMeta {
    pub capture_hz: f64,
    pub capacity: usize,
    pub count: usize,
    /// Seconds of simulation the retained samples span
    pub horizon: f64,
    pub scrub_offset: i64,
    pub scrub_active: bool,
    pub state_size: usize,
    pub signature: u32,
}

#[derive(Debug)]
pub struct HistoryBuffer {
    limits: HistoryLimits,
    signature: StateSignature,
    capture_hz: f64,
    capacity: usize,
    samples: Vec<StateBuffer>,
    stamp: Option<ModelStamp>,
    head: usize,
    count: usize,
    scrub_offset: i64,
    scrub_active: bool,
    resume_running: bool,
    last_capture: Option<Duration>,
}

impl HistoryBuffer {
    pub fn new(limits: HistoryLimits, signature: StateSignature, capture_hz: f64, capacity: usize) -> Self {
        Self {
            capture_hz: capture_hz.clamp(limits.min_hz, limits.max_hz),
            capacity: capacity.clamp(limits.min_capacity, limits.max_capacity),
            limits,
            signature,
            samples: Vec::new(),
            stamp: None,
            head: 0,
            count: 0,
            scrub_offset: 0,
            scrub_active: false,
            resume_running: false,
            last_capture: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capture_hz(&self) -> f64 {
        self.capture_hz
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_scrubbing(&self) -> bool {
        self.scrub_active
    }

    pub fn scrub_offset(&self) -> i64 {
        self.scrub_offset
    }

    fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.capture_hz)
    }

    fn state_size(&self) -> usize {
        self.samples.first().map_or(0, StateBuffer::size)
    }

    /// Apply new settings. Storage is reallocated, dropping all samples,
    /// only when the capacity, state size, signature or model changed.
    /// Returns whether that happened.
    pub fn configure(
        &mut self,
        handle: &mut SimulationHandle,
        bridge: &mut HeapBridge,
        capture_hz: Option<f64>,
        capacity: Option<usize>,
    ) -> bool {
        if let Some(hz) = capture_hz.filter(|hz| hz.is_finite()) {
            self.capture_hz = hz.clamp(self.limits.min_hz, self.limits.max_hz);
        }
        if let Some(capacity) = capacity {
            self.capacity = capacity.clamp(self.limits.min_capacity, self.limits.max_capacity);
        }
        let size = handle.state_size(bridge, self.signature);
        let unchanged = self.samples.len() == self.capacity
            && self.state_size() == size
            && self.stamp == Some(handle.stamp())
            && self.samples.first().map(StateBuffer::signature) == Some(self.signature);
        if unchanged {
            return false;
        }
        self.samples = if size > 0 {
            (0..self.capacity)
                .map(|_| StateBuffer::zeroed(self.signature, handle.stamp(), size))
                .collect()
        } else {
            Vec::new()
        };
        self.stamp = Some(handle.stamp());
        self.clear();
        debug!(
            "history reallocated: {} x {size} values at {} Hz",
            self.capacity, self.capture_hz
        );
        true
    }

    /// Capture rate matching an engine timestep
    pub fn retarget(&mut self, dt: f64) {
        if dt.is_finite() && dt > 0.0 {
            self.capture_hz = (1.0 / dt).round().clamp(self.limits.min_hz, self.limits.max_hz);
        }
    }

    /// Drop all samples and any scrub position without reallocating
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
        self.scrub_offset = 0;
        self.scrub_active = false;
        self.resume_running = false;
        self.last_capture = None;
    }

    /// Record the current state into the head slot.
    ///
    /// Unless `force`, only runs while stepping is live and the capture
    /// interval has elapsed.
    pub fn capture(
        &mut self,
        handle: &mut SimulationHandle,
        bridge: &mut HeapBridge,
        now: Duration,
        running: bool,
        force: bool,
    ) -> Result<bool, SimError> {
        if !force {
            if !running || self.scrub_active {
                return Ok(false);
            }
            if let Some(last) = self.last_capture {
                if now.saturating_sub(last) < self.interval() {
                    return Ok(false);
                }
            }
        }
        if self.samples.is_empty() || self.stamp != Some(handle.stamp()) {
            return Ok(false);
        }
        handle.capture_into(bridge, &mut self.samples[self.head])?;
        self.head = (self.head + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
        self.last_capture = Some(now);
        Ok(true)
    }

    /// Jump to the sample `|offset|` captures back; `offset >= 0` releases.
    ///
    /// The first scrub remembers whether stepping was live so release can
    /// restore it.
    pub fn scrub_to(
        &mut self,
        handle: &mut SimulationHandle,
        bridge: &mut HeapBridge,
        scheduler: &mut StepScheduler,
        offset: i64,
    ) -> Result<bool, SimError> {
        if offset >= 0 || self.count == 0 {
            self.release(scheduler);
            return Ok(false);
        }
        let k = (offset.unsigned_abs() as usize).min(self.count);
        let capacity = self.samples.len();
        let index = (self.head + capacity - k) % capacity;
        let entered = !self.scrub_active;
        if entered {
            self.resume_running = scheduler.enter_scrub() == RunState::Running;
            self.scrub_active = true;
        }
        let applied = handle.apply_state(bridge, &self.samples[index]);
        match applied {
            Ok(true) => self.scrub_offset = -(k as i64),
            // nothing was applied: keep the previous position, or drop a scrub this call started
            _ if entered => self.release(scheduler),
            _ => {}
        }
        applied
    }

    /// Change the state a later release restores. No-op when not scrubbing.
    pub fn set_resume_running(&mut self, resume: bool) {
        if self.scrub_active {
            self.resume_running = resume;
        }
    }

    /// Leave scrubbing and restore the prior running state
    pub fn release(&mut self, scheduler: &mut StepScheduler) {
        if !self.scrub_active {
            return;
        }
        scheduler.release_scrub(self.resume_running);
        self.scrub_active = false;
        self.scrub_offset = 0;
        self.resume_running = false;
    }

    pub fn meta(&self) -> HistoryMeta {
        HistoryMeta {
            capture_hz: self.capture_hz,
            capacity: self.capacity,
            count: self.count,
            horizon: self.count as f64 / self.capture_hz,
            scrub_offset: self.scrub_offset,
            scrub_active: self.scrub_active,
            state_size: self.state_size(),
            signature: self.signature.bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AbiVariant;
    use crate::engine::reference::{models, ReferenceEngine};
    use crate::simulation::handle::tests::loaded;

    fn history() -> HistoryBuffer {
        HistoryBuffer::new(HistoryLimits::default(), StateSignature::INTEGRATION, 30.0, 900)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_configuration_is_clamped() {
        let h = HistoryBuffer::new(HistoryLimits::default(), StateSignature::PHYSICS, 1000.0, 4);
        assert_eq!((h.capture_hz(), h.capacity()), (240.0, 32));
        let mut h = history();
        h.retarget(0.002);
        assert_eq!(h.capture_hz(), 240.0);
        h.retarget(0.05);
        assert_eq!(h.capture_hz(), 20.0);
    }

    #[test]
    fn test_capture_respects_interval_and_run_state() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        let mut h = history();
        h.configure(&mut handle, &mut bridge, None, None);
        assert!(!h.capture(&mut handle, &mut bridge, ms(0), false, false).unwrap());
        assert!(h.capture(&mut handle, &mut bridge, ms(0), true, false).unwrap());
        assert!(!h.capture(&mut handle, &mut bridge, ms(10), true, false).unwrap());
        assert!(h.capture(&mut handle, &mut bridge, ms(10), false, true).unwrap());
        assert!(h.capture(&mut handle, &mut bridge, ms(50), true, false).unwrap());
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_meta_reports_horizon() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        let mut h = history();
        h.configure(&mut handle, &mut bridge, None, None);
        assert_eq!(h.meta().horizon, 0.0);
        for i in 0..15 {
            h.capture(&mut handle, &mut bridge, ms(i), false, true).unwrap();
        }
        let meta = h.meta();
        assert_eq!(meta.count, 15);
        assert!((meta.horizon - 0.5).abs() < 1e-12);

        let wire = serde_json::to_value(&meta).unwrap();
        assert_eq!(wire["horizon"], serde_json::json!(0.5));
        assert_eq!(wire["scrubOffset"], serde_json::json!(0));
    }

    #[test]
    fn test_hz_change_keeps_samples() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        let mut h = history();
        assert!(h.configure(&mut handle, &mut bridge, None, None));
        h.capture(&mut handle, &mut bridge, ms(0), true, true).unwrap();
        assert!(!h.configure(&mut handle, &mut bridge, Some(60.0), None));
        assert_eq!(h.count(), 1);
        assert!(h.configure(&mut handle, &mut bridge, None, Some(64)));
        assert_eq!(h.count(), 0);
    }

    #[test]
    fn test_scrub_is_byte_exact_and_clamped() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        let mut scheduler = StepScheduler::default();
        scheduler.set_running(true);
        let mut h = HistoryBuffer::new(HistoryLimits::default(), StateSignature::INTEGRATION, 30.0, 32);
        h.configure(&mut handle, &mut bridge, None, None);

        let mut captured = Vec::new();
        for i in 0..40u64 {
            handle.step(&mut bridge, 7).unwrap();
            h.capture(&mut handle, &mut bridge, ms(i * 100), true, false).unwrap();
            captured.push(handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap());
        }
        assert_eq!(h.count(), 32);

        for k in [1usize, 5, 32] {
            assert!(h.scrub_to(&mut handle, &mut bridge, &mut scheduler, -(k as i64)).unwrap());
            let now = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();
            assert_eq!(now.values(), captured[captured.len() - k].values());
        }
        assert!(scheduler.is_scrubbing());

        // clamps to the oldest retained sample
        h.scrub_to(&mut handle, &mut bridge, &mut scheduler, -1000).unwrap();
        assert_eq!(h.scrub_offset(), -32);
        let now = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();
        assert_eq!(now.values(), captured[captured.len() - 32].values());

        assert!(!h.capture(&mut handle, &mut bridge, ms(10_000), true, false).unwrap());
        h.scrub_to(&mut handle, &mut bridge, &mut scheduler, 0).unwrap();
        assert!(scheduler.is_running());
        assert!(!h.is_scrubbing());
    }

    #[test]
    fn test_release_restores_paused() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Legacy, models::PENDULUM);
        let mut scheduler = StepScheduler::default();
        let mut h = history();
        h.configure(&mut handle, &mut bridge, None, None);
        h.capture(&mut handle, &mut bridge, ms(0), false, true).unwrap();
        h.scrub_to(&mut handle, &mut bridge, &mut scheduler, -1).unwrap();
        assert!(scheduler.is_scrubbing());
        h.release(&mut scheduler);
        assert_eq!(scheduler.state(), RunState::Idle);
    }

    #[test]
    fn test_failed_scrub_keeps_position() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        let mut scheduler = StepScheduler::default();
        scheduler.set_running(true);
        let mut h = history();
        h.configure(&mut handle, &mut bridge, None, None);
        for i in 0..4 {
            handle.step(&mut bridge, 5).unwrap();
            h.capture(&mut handle, &mut bridge, ms(i * 100), true, false).unwrap();
        }
        // samples recorded for one model are refused by another
        let mut other_bridge = HeapBridge::new(Box::new(ReferenceEngine::new(AbiVariant::Current)));
        let mut other = SimulationHandle::load(&mut other_bridge, models::PENDULUM, ModelStamp(2)).unwrap();

        assert!(!h.scrub_to(&mut other, &mut other_bridge, &mut scheduler, -2).unwrap());
        assert!(!h.is_scrubbing());
        assert_eq!(h.scrub_offset(), 0);
        assert!(scheduler.is_running());

        assert!(h.scrub_to(&mut handle, &mut bridge, &mut scheduler, -1).unwrap());
        assert!(!h.scrub_to(&mut other, &mut other_bridge, &mut scheduler, -3).unwrap());
        assert!(h.is_scrubbing());
        assert_eq!(h.scrub_offset(), -1);
        assert!(scheduler.is_scrubbing());
    }

    #[test]
    fn test_scrub_on_empty_history_releases() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        let mut scheduler = StepScheduler::default();
        scheduler.set_running(true);
        let mut h = history();
        h.configure(&mut handle, &mut bridge, None, None);
        assert!(!h.scrub_to(&mut handle, &mut bridge, &mut scheduler, -3).unwrap());
        assert!(scheduler.is_running());
    }
}
