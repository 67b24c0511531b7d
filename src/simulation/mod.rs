//! # Real-time stepping
//!
//! Everything between a raw engine handle and the session protocol:
//!
//! - [`handle`]: one loaded model instance and its calling conventions
//! - [`state`]: negotiated state vectors (capture/apply)
//! - [`fields`]: option/visual/statistic struct writes
//! - [`forces`]: external body forces
//! - [`scheduler`]: fixed-timestep stepping with rate control
//! - [`history`]: rewindable ring of captured states
//! - [`keyframes`]: native and user keyframe slots
//! - [`snapshot`]: copied-out views of the current state
//! - [`session`]: the command-driven owner of all of the above

pub mod clock;
pub mod fields;
pub mod forces;
pub mod handle;
pub mod history;
pub mod keyframes;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fields::{FieldKind, FieldValue, FieldWrite, StructTarget};
pub use forces::ForceSummary;
pub use handle::{Capabilities, Dimensions, EngineErrorInfo, ModelStamp, SimulationHandle};
pub use history::{HistoryBuffer, HistoryMeta};
pub use keyframes::{KeyframeMeta, KeyframeStore, SlotKind};
pub use scheduler::{RunState, StepScheduler, TickPlan};
pub use session::Session;
pub use snapshot::{Snapshot, WatchState};
pub use state::{StateBuffer, StateSignature};

use crate::bridge::BridgeError;

/// Failures of handle-level operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("model load failed: {message}")]
    LoadFailed { message: String, errno: i32, errmsg: String },
    #[error("{operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
        errno: i32,
        errmsg: String,
    },
    #[error("no model loaded")]
    NoModel,
    #[error("engine did not provide model/data pointers")]
    PointersUnavailable,
    #[error("state mismatch: {0}")]
    StateMismatch(String),
    #[error("cannot write field `{path}`: {reason}")]
    Field { path: String, reason: String },
}

impl SimError {
    /// Engine errno carried by the error, 0 if none
    pub fn errno(&self) -> i32 {
        match self {
            SimError::LoadFailed { errno, .. } | SimError::Engine { errno, .. } => *errno,
            _ => 0,
        }
    }

    /// Engine errmsg carried by the error, empty if none
    pub fn errmsg(&self) -> &str {
        match self {
            SimError::LoadFailed { errmsg, .. } | SimError::Engine { errmsg, .. } => errmsg,
            _ => "",
        }
    }
}
