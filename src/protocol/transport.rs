//! The transport seam and consumer-side helpers

use futures::channel::mpsc::UnboundedReceiver;
use log::warn;

use super::command::Command;
use super::event::Event;
use super::ProtocolError;

/// A session reachable through commands and events.
///
/// Implementations process commands strictly in arrival order and emit the
/// same events for the same commands.
pub trait SessionTransport {
    fn send(&mut self, command: Command) -> Result<(), ProtocolError>;

    /// Give the transport a chance to run due timers. Transports with their
    /// own thread treat this as a no-op.
    fn pump(&mut self) -> Result<(), ProtocolError>;

    fn events(&mut self) -> &mut UnboundedReceiver<Event>;

    /// Decode and send a wire command. Malformed input is logged and
    /// dropped; returns whether the command was sent.
    fn send_json(&mut self, text: &str) -> Result<bool, ProtocolError> {
        match Command::from_json(text) {
            Ok(command) => self.send(command).map(|_| true),
            Err(err) => {
                warn!("ignoring command: {err}");
                Ok(false)
            }
        }
    }
}

/// Drops snapshots that are not newer than the last one accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceGate {
    last: Option<u64>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last {
            Some(last) if seq <= last => false,
            _ => {
                self.last = Some(seq);
                true
            }
        }
    }

    /// Gate an event; anything other than a snapshot passes
    pub fn admit(&mut self, event: &Event) -> bool {
        match event {
            Event::Snapshot(snapshot) => self.accept(snapshot.seq),
            _ => true,
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}
