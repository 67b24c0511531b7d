//! Events emitted by a session

use futures::channel::mpsc::UnboundedSender;
use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::AbiVariant;
use crate::simulation::fields::StructTarget;
use crate::simulation::handle::{Capabilities, Dimensions};
use crate::simulation::history::HistoryMeta;
use crate::simulation::keyframes::KeyframeMeta;
use crate::simulation::scheduler::RunState;
use crate::simulation::snapshot::{CopyState, Snapshot, WatchState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorMeta {
    pub index: usize,
    pub name: String,
    pub ctrlrange: [f64; 2],
    /// Whether writes are clamped to `ctrlrange`
    pub limited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    pub label: String,
    pub abi: AbiVariant,
    pub abi_version: i32,
    pub dt: f64,
    pub dims: Dimensions,
    pub capabilities: Capabilities,
    pub actuators: Vec<ActuatorMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Ready(ReadyInfo),
    Snapshot(Box<Snapshot>),
    History(HistoryMeta),
    Keyframes(KeyframeMeta),
    RunState {
        state: RunState,
        paused: bool,
        rate: f64,
    },
    Options {
        options: Value,
    },
    StructState {
        target: StructTarget,
        state: Value,
    },
    Error {
        message: String,
        errno: i32,
        errmsg: String,
    },
    Log {
        message: String,
    },
    Watch(WatchState),
    CopyState(CopyState),
    Align {
        seq: u64,
        center: [f64; 3],
        radius: f64,
    },
}

impl Event {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Wire discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ready(_) => "ready",
            Event::Snapshot(_) => "snapshot",
            Event::History(_) => "history",
            Event::Keyframes(_) => "keyframes",
            Event::RunState { .. } => "run_state",
            Event::Options { .. } => "options",
            Event::StructState { .. } => "struct_state",
            Event::Error { .. } => "error",
            Event::Log { .. } => "log",
            Event::Watch(_) => "watch",
            Event::CopyState(_) => "copy_state",
            Event::Align { .. } => "align",
        }
    }
}

/// Sending half of a session's event channel.
///
/// A consumer that went away is not an error for the session; events are
/// dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        if self.tx.unbounded_send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
