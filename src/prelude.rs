//! # Forgebridge Prelude
//!
//! Commonly used types for driving a session, in one import:
//!
//! ```rust
//! use forgebridge::prelude::*;
//! ```
//!
//! A headless host typically needs nothing else:
//!
//! ```no_run
//! use forgebridge::prelude::*;
//!
//! fn main() -> Result<(), ProtocolError> {
//!     let mut transport = WorkerTransport::spawn(
//!         || Box::new(ReferenceEngine::new(AbiVariant::Current)),
//!         SessionConfig::default(),
//!         Arc::new(SystemClock::new()),
//!     )?;
//!     transport.send(Command::load(models::PENDULUM))?;
//!     while let Some(event) = transport.recv_blocking() {
//!         if let Event::Snapshot(snapshot) = event {
//!             println!("t = {:.3}", snapshot.time);
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Bridge
pub use crate::bridge::{AbiVariant, Accessor, BridgeError, EngineModule, HeapBridge, Val};

// Session configuration and engines
pub use crate::config::SessionConfig;
pub use crate::engine::reference::models;
pub use crate::engine::ReferenceEngine;

// Simulation
pub use crate::simulation::{
    Clock, FieldKind, FieldValue, ManualClock, RunState, Session, SimError, SimulationHandle, Snapshot,
    StateSignature, StructTarget, SystemClock,
};

// Protocol
pub use crate::protocol::{
    Command, Event, InlineTransport, ModelSource, ProtocolError, SequenceGate, SessionTransport, WorkerTransport,
};

// Tick timing
pub use crate::performance::{TickMetrics, TickMonitor};

// Common external and standard library types
pub use cgmath::{InnerSpace, Vector3};
pub use std::sync::Arc;
pub use std::time::Duration;
