//! The inline and worker transports must behave identically for the same
//! command stream. Every scenario here runs against both.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use forgebridge::bridge::AbiVariant;
use forgebridge::config::SessionConfig;
use forgebridge::engine::reference::{models, ReferenceEngine};
use forgebridge::protocol::{Command, Event, InlineTransport, ModelSource, SequenceGate, SessionTransport, WorkerTransport};
use forgebridge::simulation::{ManualClock, RunState, WatchState};
use futures::{FutureExt, StreamExt};
use serde_json::json;

const TICK: Duration = Duration::from_millis(8);

type Make<T> = fn(&ManualClock) -> T;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn inline(clock: &ManualClock) -> InlineTransport {
    init_logging();
    InlineTransport::new(
        Box::new(ReferenceEngine::new(AbiVariant::Current)),
        SessionConfig::default(),
        Arc::new(clock.clone()),
    )
}

fn worker(clock: &ManualClock) -> WorkerTransport {
    init_logging();
    WorkerTransport::spawn(
        || Box::new(ReferenceEngine::new(AbiVariant::Current)),
        SessionConfig::default(),
        Arc::new(clock.clone()),
    )
    .expect("worker should start")
}

/// Pump and drain until `done` holds for everything seen so far. With a
/// clock, simulated time moves one tick per round.
fn collect<T: SessionTransport>(
    transport: &mut T,
    clock: Option<&ManualClock>,
    mut done: impl FnMut(&[Event]) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        transport.pump().expect("pump");
        while let Some(event) = transport.events().next().now_or_never().flatten() {
            seen.push(event);
            if done(&seen) {
                return seen;
            }
        }
        if let Some(clock) = clock {
            clock.advance(TICK);
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!(
        "condition never held; saw {:?}",
        seen.iter().map(Event::kind).collect::<Vec<_>>()
    );
}

fn until_kind<T: SessionTransport>(transport: &mut T, kind: &str) -> Vec<Event> {
    collect(transport, None, |seen| seen.last().is_some_and(|e| e.kind() == kind))
}

fn until_count<T: SessionTransport>(transport: &mut T, n: usize) -> Vec<Event> {
    collect(transport, None, |seen| seen.len() >= n)
}

fn last_snapshot(events: &[Event]) -> &forgebridge::simulation::Snapshot {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Snapshot(s) => Some(s.as_ref()),
            _ => None,
        })
        .expect("no snapshot in events")
}

/// Run with the clock moving until the simulation passes `time`
fn run_until<T: SessionTransport>(transport: &mut T, clock: &ManualClock, time: f64) {
    collect(transport, Some(clock), |seen| {
        matches!(seen.last(), Some(Event::Snapshot(s)) if s.time >= time)
    });
}

fn ready_reports_model<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::CART_POLE)).unwrap();
    let events = until_kind(&mut transport, "snapshot");
    let kinds: Vec<_> = events.iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        ["ready", "history", "keyframes", "options", "run_state", "snapshot"]
    );
    let Event::Ready(ready) = &events[0] else { unreachable!() };
    assert_eq!(ready.label, "inline");
    assert_eq!(ready.dt, 0.004);
    assert_eq!(ready.dims.nu, 2);
    assert_eq!(ready.dims.nq, 2);
    assert_eq!(ready.actuators[0].name, "slide");
    let Event::RunState { state, paused, rate } = &events[4] else { unreachable!() };
    assert_eq!((*state, *paused, *rate), (RunState::Running, false, 1.0));
}

fn snapshots_are_sequenced<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::FALLING_BALL)).unwrap();
    let mut gate = SequenceGate::new();
    let events = collect(&mut transport, Some(&clock), |seen| {
        seen.iter().filter(|e| e.kind() == "snapshot").count() >= 6
    });
    let admitted = events.iter().filter(|e| e.kind() == "snapshot" && gate.admit(e)).count();
    assert_eq!(admitted, 6);
    assert_eq!(gate.last(), Some(6));
    // a replayed snapshot is stale
    let stale = events.iter().find(|e| e.kind() == "snapshot").unwrap();
    assert!(!gate.admit(stale));
    // the ball has started to fall
    assert!(last_snapshot(&events).time > 0.0);
}

fn load_while_scrubbing_restarts<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::PENDULUM)).unwrap();
    run_until(&mut transport, &clock, 0.1);

    transport.send(Command::HistoryScrub { offset: -2 }).unwrap();
    // ticks still in flight may deliver a few running snapshots first
    let events = collect(&mut transport, None, |seen| {
        let scrub = seen
            .iter()
            .position(|e| matches!(e, Event::History(h) if h.scrub_active && h.scrub_offset == -2));
        scrub.is_some_and(|i| seen[i..].iter().any(|e| e.kind() == "snapshot"))
    });
    assert!(last_snapshot(&events).paused);

    transport.send(Command::load(models::CART_POLE)).unwrap();
    let events = collect(&mut transport, None, |seen| {
        let ready = seen.iter().position(|e| e.kind() == "ready");
        ready.is_some_and(|i| seen[i..].iter().any(|e| e.kind() == "snapshot"))
    });
    let ready = events.iter().position(|e| e.kind() == "ready").unwrap();
    let events = &events[ready..];
    let history = events.iter().find_map(|e| match e {
        Event::History(h) => Some(h),
        _ => None,
    });
    let history = history.expect("history event after load");
    assert_eq!(history.count, 0);
    assert!(!history.scrub_active);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RunState { state: RunState::Running, paused: false, .. })));
    assert!(!last_snapshot(events).paused);
}

fn malformed_json_is_ignored<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    assert_eq!(transport.send_json("not json"), Ok(false));
    assert_eq!(transport.send_json(r#"{"cmd":"warp","speed":9}"#), Ok(false));
    assert_eq!(transport.send_json(r#"{"cmd":"setCtrl","index":0}"#), Ok(false));

    let load = json!({
        "cmd": "load",
        "source": { "label": "ball", "text": models::FALLING_BALL },
    });
    assert_eq!(transport.send_json(&load.to_string()), Ok(true));
    let events = until_kind(&mut transport, "ready");
    assert_eq!(events.len(), 1, "nothing precedes ready: {events:?}");
    let Event::Ready(ready) = &events[0] else { unreachable!() };
    assert_eq!(ready.label, "ball");
}

fn keyframe_round_trip<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::PENDULUM)).unwrap();
    until_kind(&mut transport, "snapshot");

    transport
        .send(Command::SetQpos {
            index: 0,
            value: 0.7,
            min: None,
            max: None,
        })
        .unwrap();
    transport.send(Command::KeyframeSave { index: Some(2) }).unwrap();
    let events = until_kind(&mut transport, "keyframes");
    let Some(Event::Keyframes(meta)) = events.last() else { unreachable!() };
    assert_eq!(meta.last_saved, Some(2));
    assert!(meta.slots[2].available);
    assert_eq!(meta.capacity, 2 + 5);

    transport
        .send(Command::SetQpos {
            index: 0,
            value: 3.0,
            min: Some(-1.0),
            max: Some(1.0),
        })
        .unwrap();
    transport.send(Command::Snapshot).unwrap();
    let events = until_kind(&mut transport, "snapshot");
    assert_eq!(last_snapshot(&events).qpos.as_deref(), Some(&[1.0][..]));

    transport.send(Command::KeyframeLoad { index: 2 }).unwrap();
    let events = until_kind(&mut transport, "snapshot");
    assert_eq!(last_snapshot(&events).qpos.as_deref(), Some(&[0.7][..]));
}

fn load_failure_reports_error<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport
        .send(Command::Load {
            source: ModelSource::new("first", "]"),
            fallbacks: vec![ModelSource::new("second", "{\"timestep\": \"fast\"}")],
            rate: None,
        })
        .unwrap();
    let events = until_kind(&mut transport, "run_state");
    let kinds: Vec<_> = events.iter().map(Event::kind).collect();
    assert_eq!(kinds, ["error", "log", "run_state"]);
    let Event::Error { message, errno, errmsg } = &events[0] else { unreachable!() };
    assert!(message.starts_with("model load failed"), "{message}");
    assert_ne!(*errno, 0);
    assert!(!errmsg.is_empty());

    // the session still accepts a good model afterwards
    transport.send(Command::load(models::FALLING_BALL)).unwrap();
    until_kind(&mut transport, "ready");
}

fn step_command_is_exact<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::FALLING_BALL)).unwrap();
    transport.send(Command::SetPaused { paused: true }).unwrap();
    transport.send(Command::Step { n: 25 }).unwrap();
    transport.send(Command::Step { n: -4 }).unwrap();
    let events = collect(&mut transport, None, |seen| {
        seen.iter().filter(|e| e.kind() == "snapshot").count() >= 3
    });
    let snapshot = last_snapshot(&events);
    assert!((snapshot.time - 0.052).abs() < 1e-12, "{}", snapshot.time);
    assert!(snapshot.paused);
}

fn watch_follows_field<T: SessionTransport>(make: Make<T>) {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    transport.send(Command::load(models::FALLING_BALL)).unwrap();
    transport.send_json(r#"{"cmd":"setWatch","field":"qpos","index":2}"#).unwrap();
    let events = until_kind(&mut transport, "watch");
    let Some(Event::Watch(WatchState { value, samples, .. })) = events.last() else { unreachable!() };
    assert_eq!(*value, Some(1.0));
    assert_eq!(*samples, 1);

    // broadcasts now carry the watch; the ball falls so the minimum drops
    let events = collect(&mut transport, Some(&clock), |seen| {
        matches!(seen.last(), Some(Event::Watch(w)) if w.samples >= 10)
    });
    let Some(Event::Watch(watch)) = events.last() else { unreachable!() };
    assert!(watch.min.unwrap() < 1.0);
    assert_eq!(watch.max, Some(1.0));
}

/// Deterministic script; both transports must produce identical events
fn scripted_events<T: SessionTransport>(make: Make<T>) -> Vec<Event> {
    let clock = ManualClock::new();
    let mut transport = make(&clock);
    let script = [
        Command::load(models::PENDULUM),
        Command::SetCtrl { index: 0, value: 9.0 },
        Command::Step { n: 10 },
        Command::KeyframeSave { index: Some(3) },
        Command::SetWatch {
            field: Default::default(),
            index: 0,
        },
        Command::CopyState {
            precision: Default::default(),
        },
        Command::Align,
        Command::HistoryConfig {
            capture_hz: Some(60.0),
            capacity: Some(120),
        },
        Command::ApplyBodyForce {
            body_id: 1,
            force: [1.0, 0.0, 0.0],
            torque: [0.0; 3],
        },
        Command::Step { n: 3 },
        Command::Reset,
    ];
    for command in script {
        transport.send(command).unwrap();
    }
    // load 6, step 1, save 1, watch 1, copy 1, align 1, config 1, step 2, reset 4
    until_count(&mut transport, 18)
}

macro_rules! conformance {
    ($($scenario:ident),* $(,)?) => {
        mod inline_transport {
            $(
                #[test]
                fn $scenario() {
                    super::$scenario(super::inline);
                }
            )*
        }

        mod worker_transport {
            $(
                #[test]
                fn $scenario() {
                    super::$scenario(super::worker);
                }
            )*
        }
    };
}

conformance!(
    ready_reports_model,
    snapshots_are_sequenced,
    load_while_scrubbing_restarts,
    malformed_json_is_ignored,
    keyframe_round_trip,
    load_failure_reports_error,
    step_command_is_exact,
    watch_follows_field,
);

#[test]
fn transports_emit_identical_events() {
    let inline_events = scripted_events(inline);
    let worker_events = scripted_events(worker);
    assert_eq!(inline_events.len(), 18);
    assert_eq!(inline_events, worker_events);
}

#[test]
fn worker_closes_on_drop() {
    let clock = ManualClock::new();
    let mut transport = worker(&clock);
    transport.send(Command::load(models::PENDULUM)).unwrap();
    until_kind(&mut transport, "ready");
    drop(transport);
}
