//! # Session protocol
//!
//! Commands in, events out, over one of two interchangeable transports:
//!
//! - [`WorkerTransport`]: the session lives on its own thread
//! - [`InlineTransport`]: the session runs on the caller's thread, with
//!   timers driven from [`SessionTransport::pump`]
//!
//! ```rust
//! use std::sync::Arc;
//! use forgebridge::bridge::AbiVariant;
//! use forgebridge::config::SessionConfig;
//! use forgebridge::engine::reference::{models, ReferenceEngine};
//! use forgebridge::protocol::{Command, InlineTransport, SessionTransport};
//! use forgebridge::simulation::ManualClock;
//! use futures::{FutureExt, StreamExt};
//!
//! let mut transport = InlineTransport::new(
//!     Box::new(ReferenceEngine::new(AbiVariant::Current)),
//!     SessionConfig::default(),
//!     Arc::new(ManualClock::new()),
//! );
//! transport.send(Command::load(models::PENDULUM)).unwrap();
//! let first = transport.events().next().now_or_never().flatten().unwrap();
//! assert_eq!(first.kind(), "ready");
//! ```

pub mod command;
pub mod event;
pub mod inline;
pub mod timers;
pub mod transport;
pub mod worker;

pub use command::{Command, ModelSource};
pub use event::{ActuatorMeta, Event, EventSink, ReadyInfo};
pub use inline::InlineTransport;
pub use timers::TickTimers;
pub use transport::{SequenceGate, SessionTransport};
pub use worker::WorkerTransport;

/// Failures at the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("session transport is closed")]
    Closed,
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("could not start session worker: {0}")]
    Spawn(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Spawn(err.to_string())
    }
}
