//! # Forgebridge Headless Example
//!
//! Runs the bundled reference engine on a worker thread with no renderer
//! attached, and prints what the session reports.
//!
//! ## What this example shows:
//! - How to start a worker session and load a model with a fallback
//! - How to push control input and change the playback rate
//! - How to rewind through recorded history and resume
//! - How to save and restore a keyframe
//!
//! ## Usage:
//! ```bash
//! RUST_LOG=debug cargo run --example headless
//! ```

use std::thread;

use anyhow::{bail, Context, Result};
use forgebridge::prelude::*;
use log::info;

/// Drain events until one of `kind` arrives, logging the rest
fn wait_for(transport: &mut WorkerTransport, gate: &mut SequenceGate, kind: &str) -> Result<Event> {
    loop {
        let event = transport
            .recv_blocking()
            .context("session worker stopped")?;
        if !gate.admit(&event) {
            continue;
        }
        if event.kind() == kind {
            return Ok(event);
        }
        match &event {
            Event::Error { message, .. } => bail!("session error: {message}"),
            Event::Log { message } => info!("session: {message}"),
            _ => {}
        }
    }
}

/// Print the latest snapshot's time and the pendulum angle
fn report(transport: &mut WorkerTransport, gate: &mut SequenceGate, label: &str) -> Result<()> {
    transport.send(Command::Snapshot)?;
    if let Event::Snapshot(snapshot) = wait_for(transport, gate, "snapshot")? {
        let angle = snapshot.qpos.as_deref().and_then(|q| q.first().copied()).unwrap_or_default();
        println!(
            "{label:>10}: t = {:7.3}s  angle = {angle:+.4}  rate = {}x  tick = {:.3}ms",
            snapshot.time, snapshot.rate, snapshot.info.avg_tick_ms
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut transport = WorkerTransport::spawn(
        || Box::new(ReferenceEngine::new(AbiVariant::Current)),
        SessionConfig::default(),
        Arc::new(SystemClock::new()),
    )?;
    let mut gate = SequenceGate::new();

    // The first source is deliberately broken; the session falls through to
    // the pendulum
    transport.send(Command::Load {
        source: ModelSource::new("broken", "{ not a model"),
        fallbacks: vec![ModelSource::new("pendulum", models::PENDULUM)],
        rate: None,
    })?;
    if let Event::Ready(ready) = wait_for(&mut transport, &mut gate, "ready")? {
        println!(
            "loaded `{}` ({} ABI v{}) dt = {}s, {} actuator(s)",
            ready.label,
            ready.abi,
            ready.abi_version,
            ready.dt,
            ready.actuators.len()
        );
    }

    // Push the pendulum for half a second
    transport.send(Command::SetCtrl { index: 0, value: 1.5 })?;
    thread::sleep(Duration::from_millis(500));
    report(&mut transport, &mut gate, "pushed")?;

    transport.send(Command::SetCtrl { index: 0, value: 0.0 })?;
    transport.send(Command::SetRate { rate: 4.0 })?;
    thread::sleep(Duration::from_millis(500));
    report(&mut transport, &mut gate, "4x")?;

    // Slots 0 and 1 hold the model's own keyframes
    transport.send(Command::KeyframeSave { index: Some(2) })?;
    wait_for(&mut transport, &mut gate, "keyframes")?;

    // Rewind through the most recent captures
    for offset in [-30, -15, -1] {
        transport.send(Command::HistoryScrub { offset })?;
        if let Event::History(meta) = wait_for(&mut transport, &mut gate, "history")? {
            println!("scrubbed to {} of {} samples", meta.scrub_offset, meta.count);
        }
        report(&mut transport, &mut gate, "scrub")?;
    }

    // Resume from the scrubbed state, then jump back to the saved keyframe
    transport.send(Command::HistoryScrub { offset: 0 })?;
    thread::sleep(Duration::from_millis(250));
    report(&mut transport, &mut gate, "resumed")?;

    transport.send(Command::KeyframeLoad { index: 2 })?;
    report(&mut transport, &mut gate, "keyframe")?;

    Ok(())
}
