//! Command-driven owner of one engine module and its loaded model
//!
//! A [`Session`] is the only thing that touches the engine. Transports feed
//! it commands in arrival order and call [`Session::tick`] and
//! [`Session::broadcast`] on their timers; everything it reports leaves
//! through its [`EventSink`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use super::clock::Clock;
use super::fields::{mirror_value, set_mirror_path, FieldWrite, StructTarget};
use super::handle::{ModelStamp, SimulationHandle};
use super::history::HistoryBuffer;
use super::keyframes::KeyframeStore;
use super::scheduler::{RunState, StepScheduler};
use super::snapshot::{Bounds, CopyPrecision, CopyState, PauseSource, Snapshot, WatchField, WatchState, WatchStatus};
use super::SimError;
use crate::bridge::{Accessor, EngineModule, HeapBridge};
use crate::config::SessionConfig;
use crate::performance::TickMonitor;
use crate::protocol::command::{Command, ModelSource};
use crate::protocol::event::{ActuatorMeta, Event, EventSink, ReadyInfo};

/// Timestep assumed when the engine build does not expose one
const DEFAULT_DT: f64 = 0.002;

pub struct Session {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    bridge: HeapBridge,
    handle: Option<SimulationHandle>,
    label: String,
    next_stamp: u64,
    dt: f64,
    scheduler: StepScheduler,
    history: HistoryBuffer,
    keyframes: KeyframeStore,
    /// Control writes waiting for the next tick, last writer wins
    pending_ctrl: BTreeMap<usize, f64>,
    ctrl_ranges: Vec<Option<(f64, f64)>>,
    events: EventSink,
    monitor: TickMonitor,
    watch: WatchState,
    mirrors: HashMap<StructTarget, Value>,
    snapshot_seq: u64,
    copy_seq: u64,
    align_seq: u64,
}

impl Session {
    pub fn new(module: Box<dyn EngineModule>, config: SessionConfig, clock: Arc<dyn Clock>, events: EventSink) -> Self {
        let history = HistoryBuffer::new(
            config.history_limits,
            config.signature,
            config.history_hz,
            config.history_capacity,
        );
        Self {
            bridge: HeapBridge::new(module),
            handle: None,
            label: String::new(),
            next_stamp: 0,
            dt: DEFAULT_DT,
            scheduler: StepScheduler::new(config.scheduler),
            history,
            keyframes: KeyframeStore::new(config.user_keyframe_slots, config.signature),
            pending_ctrl: BTreeMap::new(),
            ctrl_ranges: Vec::new(),
            events,
            monitor: TickMonitor::new(),
            watch: WatchState::default(),
            mirrors: HashMap::new(),
            snapshot_seq: 0,
            copy_seq: 0,
            align_seq: 0,
            config,
            clock,
        }
    }

    pub fn handle(&self) -> Option<&SimulationHandle> {
        self.handle.as_ref()
    }

    pub fn run_state(&self) -> RunState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &StepScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn keyframes(&self) -> &KeyframeStore {
        &self.keyframes
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Current simulation time, 0 without a model
    pub fn time(&mut self) -> f64 {
        self.handle.as_ref().map_or(0.0, |h| h.time(&mut self.bridge))
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { source, fallbacks, rate } => self.load(source, fallbacks, rate),
            Command::Reset => self.reset(),
            Command::Step { n } => self.step(n),
            Command::SetCtrl { index, value } => {
                if value.is_finite() {
                    self.pending_ctrl.insert(index, value);
                } else {
                    warn!("ignoring non-finite control for actuator {index}");
                }
            }
            Command::SetPaused { paused } => self.set_paused(paused),
            Command::SetRate { rate } => {
                let applied = self.scheduler.set_rate(rate);
                debug!("rate set to {applied}");
                self.emit_run_state();
            }
            Command::HistoryScrub { offset } => self.scrub(offset),
            Command::HistoryConfig { capture_hz, capacity } => {
                if let Some(handle) = self.handle.as_mut() {
                    self.history.configure(handle, &mut self.bridge, capture_hz, capacity);
                }
                self.emit_history();
            }
            Command::KeyframeSave { index } => self.keyframe_save(index),
            Command::KeyframeLoad { index } => self.keyframe_load(index),
            Command::KeyframeSelect { index } => {
                self.keyframes.select(index);
                self.emit_keyframes();
            }
            Command::SetField {
                target,
                path,
                kind,
                value,
                size,
            } => self.set_field(FieldWrite {
                target,
                path,
                kind,
                value,
                size,
            }),
            Command::ApplyForce {
                geom_index,
                force,
                torque,
                point,
            } => {
                let Some(handle) = self.handle.as_mut() else {
                    return self.no_model("applyForce");
                };
                let applied = handle.apply_force(&mut self.bridge, geom_index, force, torque, point);
                self.report_force("applyForce", applied);
            }
            Command::ApplyBodyForce { body_id, force, torque } => {
                let Some(handle) = self.handle.as_mut() else {
                    return self.no_model("applyBodyForce");
                };
                let applied = handle.apply_body_force(&mut self.bridge, body_id, force, torque);
                self.report_force("applyBodyForce", applied);
            }
            Command::ClearForces => {
                let Some(handle) = self.handle.as_mut() else {
                    return self.no_model("clearForces");
                };
                let cleared = handle.clear_forces(&mut self.bridge).map(|_| true);
                self.report_force("clearForces", cleared);
            }
            Command::SetQpos { index, value, min, max } => self.set_qpos(index, value, min, max),
            Command::SetWatch { field, index } => self.set_watch(field, index),
            Command::CopyState { precision } => self.copy_state(precision),
            Command::Align => self.align(),
            Command::Snapshot => self.broadcast(),
        }
    }

    fn load(&mut self, source: ModelSource, fallbacks: Vec<ModelSource>, rate: Option<f64>) {
        self.scheduler.force_idle();
        self.history.clear();
        if let Some(mut old) = self.handle.take() {
            old.free(&mut self.bridge);
        }
        self.pending_ctrl.clear();
        self.mirrors.clear();

        let mut failure = None;
        for candidate in std::iter::once(source).chain(fallbacks) {
            self.next_stamp += 1;
            match SimulationHandle::load(&mut self.bridge, &candidate.text, ModelStamp(self.next_stamp)) {
                Ok(handle) => {
                    self.label = candidate.label;
                    self.handle = Some(handle);
                    break;
                }
                Err(err) => {
                    warn!("model source `{}` failed: {err}", candidate.label);
                    failure = Some(err);
                }
            }
        }

        let Some(handle) = self.handle.as_mut() else {
            let err = failure.unwrap_or(SimError::NoModel);
            let message = match &err {
                SimError::LoadFailed { .. } => err.to_string(),
                other => format!("model load failed: {other}"),
            };
            error!("{message}");
            self.events.emit(Event::Error {
                message: message.clone(),
                errno: err.errno(),
                errmsg: err.errmsg().to_string(),
            });
            self.log(message, true);
            self.emit_run_state();
            return;
        };

        self.dt = handle.timestep(&mut self.bridge).unwrap_or(DEFAULT_DT);
        self.history.retarget(self.dt);
        self.history.configure(handle, &mut self.bridge, None, None);
        if let Err(err) = self.keyframes.populate(handle, &mut self.bridge) {
            warn!("keyframe probe failed: {err}");
        }
        self.ctrl_ranges = handle.ctrl_ranges(&mut self.bridge);
        if self.watch.status != WatchStatus::Idle {
            self.watch.retarget(self.watch.field, self.watch.index);
        }
        if let Some(rate) = rate {
            self.scheduler.set_rate(rate);
        }
        self.scheduler.set_running(true);
        info!("session loaded `{}` (dt={})", self.label, self.dt);

        self.emit_ready();
        self.emit_history();
        self.emit_keyframes();
        self.emit_options();
        self.emit_run_state();
        self.broadcast();
    }

    fn reset(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("reset");
        };
        self.history.release(&mut self.scheduler);
        match handle.reset(&mut self.bridge) {
            Ok(()) => {
                self.history.clear();
                self.scheduler.reset_baseline();
                info!("session reset");
            }
            Err(err) => self.report_error(&err),
        }
        self.emit_history();
        self.emit_run_state();
        self.broadcast();
    }

    fn step(&mut self, n: i64) {
        let n = n.clamp(1, self.config.max_step_command.max(1) as i64) as u32;
        self.drain_ctrl();
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("step");
        };
        let was_scrubbing = self.history.is_scrubbing();
        self.history.release(&mut self.scheduler);
        // each explicit step is preceded by a forced capture so it can be scrubbed back
        for _ in 0..n {
            let now = self.clock.now();
            if let Err(err) = self.history.capture(handle, &mut self.bridge, now, false, true) {
                warn!("history capture failed: {err}");
            }
            if let Err(err) = handle.step(&mut self.bridge, 1) {
                self.report_error(&err);
                break;
            }
        }
        if was_scrubbing {
            self.emit_history();
            self.emit_run_state();
        }
        self.broadcast();
    }

    fn set_paused(&mut self, paused: bool) {
        if self.history.is_scrubbing() {
            self.history.set_resume_running(!paused);
            if !paused {
                self.history.release(&mut self.scheduler);
                self.emit_history();
            }
        } else {
            self.scheduler.set_running(!paused);
        }
        self.emit_run_state();
    }

    fn scrub(&mut self, offset: i64) {
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("historyScrub");
        };
        if let Err(err) = self.history.scrub_to(handle, &mut self.bridge, &mut self.scheduler, offset) {
            self.report_error(&err);
        }
        self.emit_history();
        self.emit_run_state();
        self.broadcast();
    }

    fn keyframe_save(&mut self, index: Option<usize>) {
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("keyframeSave");
        };
        match self.keyframes.save(handle, &mut self.bridge, index) {
            Ok(Some(slot)) => debug!("saved keyframe slot {slot}"),
            Ok(None) => self.log("keyframe save unavailable".into(), false),
            Err(err) => self.report_error(&err),
        }
        self.emit_keyframes();
    }

    fn keyframe_load(&mut self, index: usize) {
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("keyframeLoad");
        };
        match self.keyframes.load(handle, &mut self.bridge, index) {
            Ok(true) => {
                self.history.release(&mut self.scheduler);
                self.scheduler.reset_baseline();
                self.emit_keyframes();
                self.emit_history();
                self.emit_run_state();
                self.broadcast();
            }
            Ok(false) => {
                self.log(format!("keyframe slot {index} is empty"), false);
                self.emit_keyframes();
            }
            Err(err) => {
                self.report_error(&err);
                self.emit_keyframes();
            }
        }
    }

    fn set_field(&mut self, write: FieldWrite) {
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("setField");
        };
        let values = match handle.write_field(&mut self.bridge, &write) {
            Ok(values) => values,
            Err(err) => return self.report_error(&err),
        };
        match write.target {
            StructTarget::Option => {
                if write.is_timestep() {
                    if let Some(dt) = handle.timestep(&mut self.bridge) {
                        self.dt = dt;
                        self.history.retarget(dt);
                    }
                    self.scheduler.reset_baseline();
                    self.emit_history();
                }
                self.emit_options();
                self.broadcast();
            }
            target => {
                let mirror = self
                    .mirrors
                    .entry(target)
                    .or_insert_with(|| Value::Object(Map::new()));
                set_mirror_path(mirror, &write.path, mirror_value(write.kind, &values));
                let state = mirror.clone();
                self.events.emit(Event::StructState { target, state });
            }
        }
    }

    fn set_qpos(&mut self, index: usize, value: f64, min: Option<f64>, max: Option<f64>) {
        if !value.is_finite() {
            warn!("ignoring non-finite qpos[{index}]");
            return;
        }
        let Some(handle) = self.handle.as_mut() else {
            return self.no_model("setQpos");
        };
        let mut v = value;
        if let Some(min) = min.filter(|m| m.is_finite()) {
            v = v.max(min);
        }
        if let Some(max) = max.filter(|m| m.is_finite()) {
            v = v.min(max);
        }
        let nq = handle.dims().nq;
        let written = {
            let mut qpos = handle.view_mut::<f64>(&mut self.bridge, Accessor::Qpos, nq);
            match qpos.get_mut(index) {
                Some(slot) => {
                    *slot = v;
                    true
                }
                None => false,
            }
        };
        if !written {
            self.log(format!("setQpos: index {index} out of range"), false);
            return;
        }
        if let Err(err) = handle.forward(&mut self.bridge) {
            self.report_error(&err);
        }
    }

    fn set_watch(&mut self, field: WatchField, index: usize) {
        self.watch.retarget(field, index);
        if let Some(handle) = self.handle.as_ref() {
            self.watch.sample(handle, &mut self.bridge);
        }
        self.events.emit(Event::Watch(self.watch.clone()));
    }

    fn copy_state(&mut self, precision: CopyPrecision) {
        let Some(handle) = self.handle.as_ref() else {
            return self.no_model("copyState");
        };
        self.copy_seq += 1;
        let copy = CopyState::read(handle, &mut self.bridge, self.copy_seq, precision);
        self.events.emit(Event::CopyState(copy));
    }

    fn align(&mut self) {
        let Some(handle) = self.handle.as_ref() else {
            return self.no_model("align");
        };
        let ngeom = handle.dims().ngeom;
        let xpos = handle.read_array::<f64>(&mut self.bridge, Accessor::GeomXpos, 3 * ngeom);
        let bounds = Bounds::of_points(&xpos);
        self.align_seq += 1;
        self.events.emit(Event::Align {
            seq: self.align_seq,
            center: bounds.center,
            radius: bounds.radius,
        });
    }

    /// Write pending control values into the engine, clamped to each
    /// actuator's range
    fn drain_ctrl(&mut self) {
        if self.pending_ctrl.is_empty() {
            return;
        }
        if let Some(handle) = self.handle.as_ref() {
            let nu = handle.dims().nu;
            let mut ctrl = handle.view_mut::<f64>(&mut self.bridge, Accessor::Ctrl, nu);
            for (&index, &value) in &self.pending_ctrl {
                let Some(slot) = ctrl.get_mut(index) else {
                    continue;
                };
                *slot = match self.ctrl_ranges.get(index) {
                    Some(Some((lo, hi))) => value.clamp(*lo, *hi),
                    _ => value,
                };
            }
        }
        self.pending_ctrl.clear();
    }

    /// Stepping tick: drain controls, record history, pay off step debt
    pub fn tick(&mut self) {
        self.drain_ctrl();
        let now = self.clock.now();
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if self.scheduler.is_running() {
            if let Err(err) = self.history.capture(handle, &mut self.bridge, now, true, false) {
                warn!("history capture failed: {err}");
            }
        }
        if let Some(dt) = handle.timestep(&mut self.bridge) {
            self.dt = dt;
        }
        let Some(plan) = self.scheduler.plan(now, self.dt) else {
            return;
        };
        if plan.steps == 0 {
            self.scheduler.commit(plan, 0.0);
            return;
        }
        self.monitor.begin_tick();
        let before = handle.time(&mut self.bridge);
        let result = handle.step(&mut self.bridge, plan.steps);
        let advanced = (handle.time(&mut self.bridge) - before).max(0.0);
        self.scheduler.commit(plan, advanced);
        self.monitor.end_tick(plan.steps);
        if let Err(err) = result {
            error!("tick aborted: {err}");
            self.report_error(&err);
        }
    }

    /// Snapshot tick: copy state out and emit it, plus the watch if set
    pub fn broadcast(&mut self) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        let mut snapshot = Snapshot::read(handle, &mut self.bridge, self.config.qpos_snapshot_limit);
        self.snapshot_seq += 1;
        snapshot.seq = self.snapshot_seq;
        snapshot.paused = !self.scheduler.is_running();
        snapshot.pause_source = match self.scheduler.state() {
            RunState::Running => None,
            RunState::Scrubbing => Some(PauseSource::History),
            RunState::Idle => Some(PauseSource::User),
        };
        snapshot.rate = self.scheduler.rate();
        snapshot.measured_slowdown = self.scheduler.measured_slowdown();
        let metrics = self.monitor.metrics();
        snapshot.info.avg_tick_ms = metrics.avg_tick_ms;
        snapshot.info.max_tick_ms = metrics.max_tick_ms;

        let watch = (self.watch.status != WatchStatus::Idle).then(|| {
            self.watch.sample(handle, &mut self.bridge);
            self.watch.clone()
        });
        self.events.emit(Event::Snapshot(Box::new(snapshot)));
        if let Some(watch) = watch {
            self.events.emit(Event::Watch(watch));
        }
    }

    /// Stop stepping and release the loaded model
    pub fn shutdown(&mut self) {
        self.scheduler.force_idle();
        self.history.clear();
        if let Some(mut handle) = self.handle.take() {
            handle.free(&mut self.bridge);
            info!("session shut down");
        }
    }

    fn report_force(&mut self, operation: &str, result: Result<bool, SimError>) {
        match result {
            Ok(true) => {}
            Ok(false) => self.log(format!("{operation} had no effect"), false),
            Err(err) => self.report_error(&err),
        }
    }

    fn report_error(&self, err: &SimError) {
        error!("{err}");
        self.events.emit(Event::Error {
            message: err.to_string(),
            errno: err.errno(),
            errmsg: err.errmsg().to_string(),
        });
    }

    fn no_model(&self, operation: &str) {
        warn!("{operation} ignored: no model loaded");
        self.log(format!("{operation} ignored: no model loaded"), false);
    }

    fn log(&self, message: String, force: bool) {
        if force || self.config.verbose_events {
            self.events.emit(Event::Log { message });
        }
    }

    fn emit_ready(&mut self) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        let names = handle.actuator_names(&mut self.bridge);
        let actuators = self
            .ctrl_ranges
            .iter()
            .enumerate()
            .map(|(index, range)| ActuatorMeta {
                index,
                name: names.get(index).cloned().unwrap_or_default(),
                ctrlrange: range.map_or([-1.0, 1.0], |(lo, hi)| [lo, hi]),
                limited: range.is_some(),
            })
            .collect();
        let capabilities = handle.capabilities();
        if !capabilities.missing.is_empty() {
            warn!("engine build lacks optional accessors: {:?}", capabilities.missing);
        }
        let ready = ReadyInfo {
            label: self.label.clone(),
            abi: handle.variant(),
            abi_version: handle.abi_version(&mut self.bridge),
            dt: self.dt,
            dims: handle.dims(),
            capabilities,
            actuators,
        };
        self.events.emit(Event::Ready(ready));
    }

    fn emit_options(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let options = handle.read_options(&mut self.bridge);
        self.events.emit(Event::Options { options });
    }

    fn emit_history(&self) {
        self.events.emit(Event::History(self.history.meta()));
    }

    fn emit_keyframes(&self) {
        self.events.emit(Event::Keyframes(self.keyframes.meta()));
    }

    fn emit_run_state(&self) {
        self.events.emit(Event::RunState {
            state: self.scheduler.state(),
            paused: !self.scheduler.is_running(),
            rate: self.scheduler.rate(),
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AbiVariant;
    use crate::engine::reference::{models, FaultPlan, ReferenceEngine};
    use crate::simulation::clock::ManualClock;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};
    use futures::{FutureExt, StreamExt};
    use std::time::Duration;

    fn session_with(engine: ReferenceEngine) -> (Session, ManualClock, UnboundedReceiver<Event>) {
        let clock = ManualClock::new();
        let (tx, rx) = unbounded();
        let session = Session::new(
            Box::new(engine),
            SessionConfig::default(),
            Arc::new(clock.clone()),
            EventSink::new(tx),
        );
        (session, clock, rx)
    }

    fn session() -> (Session, ManualClock, UnboundedReceiver<Event>) {
        session_with(ReferenceEngine::new(AbiVariant::Current))
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = rx.next().now_or_never().flatten() {
            out.push(event);
        }
        out
    }

    fn run_ticks(session: &mut Session, clock: &ManualClock, ticks: u32) {
        for _ in 0..ticks {
            clock.advance(Duration::from_millis(8));
            session.tick();
        }
    }

    #[test]
    fn test_load_emits_lifecycle_events() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        let kinds: Vec<_> = drain(&mut rx).iter().map(Event::kind).collect();
        assert_eq!(
            kinds,
            ["ready", "history", "keyframes", "options", "run_state", "snapshot"]
        );
        assert_eq!(session.run_state(), RunState::Running);
        assert_eq!(session.history().count(), 0);
        assert_eq!(session.history().capture_hz(), 240.0);
    }

    #[test]
    fn test_ready_describes_actuators() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::CART_POLE));
        let Some(Event::Ready(ready)) = drain(&mut rx).into_iter().next() else {
            panic!("expected ready first");
        };
        assert_eq!(ready.abi, AbiVariant::Current);
        assert_eq!(ready.abi_version, 3);
        assert_eq!(ready.dt, 0.004);
        assert_eq!(ready.actuators[0].ctrlrange, [-1.0, 1.0]);
        assert!(ready.actuators[0].limited);
        assert_eq!(ready.actuators[1].name, "hinge");
        assert!(!ready.actuators[1].limited);
        assert!(ready.capabilities.state);
    }

    #[test]
    fn test_first_running_tick_takes_first_sample() {
        let (mut session, clock, _rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        run_ticks(&mut session, &clock, 1);
        assert_eq!(session.history().count(), 1);
    }

    #[test]
    fn test_load_while_scrubbing_leaves_running() {
        let (mut session, clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        run_ticks(&mut session, &clock, 50);
        assert!(session.history().count() > 2);
        session.handle_command(Command::HistoryScrub { offset: -2 });
        assert_eq!(session.run_state(), RunState::Scrubbing);

        session.handle_command(Command::load(models::CART_POLE));
        assert_eq!(session.run_state(), RunState::Running);
        assert!(!session.history().is_scrubbing());
        assert_eq!(session.history().count(), 0);
        let history = drain(&mut rx).into_iter().rev().find_map(|e| match e {
            Event::History(meta) => Some(meta),
            _ => None,
        });
        assert_eq!(history.map(|h| (h.count, h.scrub_active)), Some((0, false)));
    }

    #[test]
    fn test_ten_second_gap_is_bounded() {
        let (mut session, clock, _rx) = session();
        session.handle_command(Command::load(models::FALLING_BALL));
        session.handle_command(Command::SetRate { rate: 16.0 });
        run_ticks(&mut session, &clock, 1);
        let before = session.time();
        clock.advance(Duration::from_secs(10));
        session.tick();
        let steps = ((session.time() - before) / 0.002).round() as u32;
        assert_eq!(steps, 240);
    }

    #[test]
    fn test_rate_doubles_sim_time() {
        let elapsed = |rate: f64| {
            let (mut session, clock, _rx) = session();
            session.handle_command(Command::load(models::PENDULUM));
            session.handle_command(Command::SetRate { rate });
            run_ticks(&mut session, &clock, 126);
            session.time()
        };
        let normal = elapsed(1.0);
        let double = elapsed(2.0);
        assert!((normal - 1.0).abs() < 0.01, "{normal}");
        assert!((double / normal - 2.0).abs() < 0.02, "{normal} vs {double}");
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut session, clock, _rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        session.handle_command(Command::SetPaused { paused: true });
        run_ticks(&mut session, &clock, 20);
        assert_eq!(session.time(), 0.0);
        session.handle_command(Command::SetPaused { paused: false });
        run_ticks(&mut session, &clock, 20);
        assert!(session.time() > 0.0);
    }

    #[test]
    fn test_unpause_releases_scrub() {
        let (mut session, clock, _rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        run_ticks(&mut session, &clock, 30);
        session.handle_command(Command::SetPaused { paused: true });
        session.handle_command(Command::HistoryScrub { offset: -2 });
        assert_eq!(session.run_state(), RunState::Scrubbing);
        // pausing again while scrubbing keeps the scrub
        session.handle_command(Command::SetPaused { paused: true });
        assert_eq!(session.run_state(), RunState::Scrubbing);
        session.handle_command(Command::SetPaused { paused: false });
        assert_eq!(session.run_state(), RunState::Running);
        assert!(!session.history().is_scrubbing());
    }

    #[test]
    fn test_ctrl_is_clamped_before_explicit_step() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        session.handle_command(Command::SetCtrl { index: 0, value: 1.0 });
        session.handle_command(Command::SetCtrl { index: 0, value: 5.0 });
        drain(&mut rx);
        session.handle_command(Command::Step { n: 0 });
        let snapshot = drain(&mut rx).into_iter().find_map(|e| match e {
            Event::Snapshot(s) => Some(s),
            _ => None,
        });
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.ctrl, vec![2.0]);
        assert!((snapshot.time - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_explicit_steps_are_scrubbable() {
        let (mut session, _clock, _rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        session.handle_command(Command::SetPaused { paused: true });
        for _ in 0..5 {
            session.handle_command(Command::Step { n: 1 });
        }
        assert_eq!(session.history().count(), 5);
        assert!((session.time() - 0.010).abs() < 1e-12);

        // the last sample is the state before the fifth step
        session.handle_command(Command::HistoryScrub { offset: -1 });
        assert_eq!(session.run_state(), RunState::Scrubbing);
        assert!((session.time() - 0.008).abs() < 1e-12);

        // a multi-step command captures before every step
        session.handle_command(Command::Step { n: 3 });
        assert!(!session.history().is_scrubbing());
        assert_eq!(session.history().count(), 8);
        assert_eq!(session.run_state(), RunState::Idle);
        session.handle_command(Command::HistoryScrub { offset: -3 });
        assert!((session.time() - 0.008).abs() < 1e-12);
    }

    #[test]
    fn test_fallback_chain() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::Load {
            source: ModelSource::new("broken", "{"),
            fallbacks: vec![ModelSource::new("ball", models::FALLING_BALL)],
            rate: Some(2.0),
        });
        let events = drain(&mut rx);
        let Some(Event::Ready(ready)) = events.first() else {
            panic!("expected ready");
        };
        assert_eq!(ready.label, "ball");
        assert_eq!(session.scheduler().rate(), 2.0);
    }

    #[test]
    fn test_total_load_failure_reports_errno() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::Load {
            source: ModelSource::new("a", "not json"),
            fallbacks: vec![ModelSource::new("b", "{\"bodies\": 3}")],
            rate: None,
        });
        let events = drain(&mut rx);
        let error = events.iter().find_map(|e| match e {
            Event::Error { message, errno, errmsg } => Some((message.clone(), *errno, errmsg.clone())),
            _ => None,
        });
        let (message, errno, errmsg) = error.unwrap();
        assert!(message.starts_with("model load failed"));
        assert_ne!(errno, 0);
        assert!(!errmsg.is_empty());
        assert!(events.iter().any(|e| e.kind() == "log"));
        assert!(session.handle().is_none());
        assert_eq!(session.run_state(), RunState::Idle);
    }

    #[test]
    fn test_step_failure_emits_error() {
        let faults = FaultPlan::new();
        let (mut session, clock, mut rx) =
            session_with(ReferenceEngine::new(AbiVariant::Current).with_faults(faults.clone()));
        session.handle_command(Command::load(models::FALLING_BALL));
        drain(&mut rx);
        faults.fail_after_steps(3);
        run_ticks(&mut session, &clock, 5);
        let errors: Vec<_> = drain(&mut rx).into_iter().filter(|e| e.kind() == "error").collect();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_timestep_write_retargets_history() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        drain(&mut rx);
        session.handle_command(
            Command::from_json(
                r#"{"cmd":"setField","target":"option","path":["timestep"],"kind":"float","value":0.01}"#,
            )
            .unwrap(),
        );
        assert_eq!(session.dt(), 0.01);
        assert_eq!(session.history().capture_hz(), 100.0);
        let kinds: Vec<_> = drain(&mut rx).iter().map(Event::kind).collect();
        assert_eq!(kinds, ["history", "options", "snapshot"]);
    }

    #[test]
    fn test_visual_write_updates_mirror() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        drain(&mut rx);
        session.handle_command(
            Command::from_json(
                r#"{"cmd":"setField","target":"visual","path":["headlight","ambient"],"kind":"float_vec","value":[0.1,0.2,0.3]}"#,
            )
            .unwrap(),
        );
        match drain(&mut rx).pop() {
            Some(Event::StructState { target, state }) => {
                assert_eq!(target, StructTarget::Visual);
                assert_eq!(state["headlight"]["ambient"], serde_json::json!([0.1, 0.2, 0.3]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_keyframe_load_releases_scrub() {
        let (mut session, clock, _rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        run_ticks(&mut session, &clock, 30);
        session.handle_command(Command::HistoryScrub { offset: -3 });
        assert_eq!(session.run_state(), RunState::Scrubbing);
        session.handle_command(Command::KeyframeLoad { index: 1 });
        assert_eq!(session.run_state(), RunState::Running);
        assert_eq!(session.keyframes().meta().last_loaded, Some(1));
    }

    #[test]
    fn test_snapshot_sequence_survives_reload() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        session.handle_command(Command::Snapshot);
        session.handle_command(Command::load(models::PENDULUM));
        let seqs: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Snapshot(s) => Some(s.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_watch_copy_and_align() {
        let (mut session, _clock, mut rx) = session();
        session.handle_command(Command::load(models::FALLING_BALL));
        drain(&mut rx);
        session.handle_command(Command::SetWatch {
            field: WatchField::Qpos,
            index: 2,
        });
        session.handle_command(Command::CopyState {
            precision: CopyPrecision::Standard,
        });
        session.handle_command(Command::Align);
        let events = drain(&mut rx);
        match &events[0] {
            Event::Watch(watch) => assert_eq!(watch.value, Some(1.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&events[1], Event::CopyState(copy) if copy.seq == 1 && copy.qpos.len() == 7));
        assert!(matches!(&events[2], Event::Align { seq: 1, .. }));
    }

    #[test]
    fn test_shutdown_releases_model() {
        let (mut session, clock, mut rx) = session();
        session.handle_command(Command::load(models::PENDULUM));
        session.shutdown();
        assert!(session.handle().is_none());
        assert_eq!(session.run_state(), RunState::Idle);
        drain(&mut rx);
        run_ticks(&mut session, &clock, 3);
        session.broadcast();
        assert!(drain(&mut rx).is_empty());
    }
}
