// src/lib.rs
//! Forgebridge
//!
//! Drives a natively-compiled rigid-body physics engine in real time: a
//! bounds-checked bridge over its exports and linear memory, a fixed-timestep
//! scheduler, rewindable history, keyframes, and a command/event protocol
//! that runs the session inline or on its own thread.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod performance;
pub mod prelude;
pub mod protocol;
pub mod simulation;

use std::sync::Arc;

use bridge::AbiVariant;
use config::SessionConfig;
use engine::ReferenceEngine;
use protocol::{ProtocolError, WorkerTransport};
use simulation::SystemClock;

/// Starts a worker session around the bundled reference engine with the
/// default configuration and wall clock
pub fn default() -> Result<WorkerTransport, ProtocolError> {
    WorkerTransport::spawn(
        || Box::new(ReferenceEngine::new(AbiVariant::Current)),
        SessionConfig::default(),
        Arc::new(SystemClock::new()),
    )
}
