//! Session driven on the caller's thread

use std::sync::Arc;

use futures::channel::mpsc::{unbounded, UnboundedReceiver};

use super::command::Command;
use super::event::{Event, EventSink};
use super::timers::TickTimers;
use super::transport::SessionTransport;
use super::ProtocolError;
use crate::bridge::EngineModule;
use crate::config::SessionConfig;
use crate::simulation::clock::Clock;
use crate::simulation::session::Session;

/// Executes commands synchronously inside [`send`](SessionTransport::send)
/// and runs due timer ticks from [`pump`](SessionTransport::pump)
pub struct InlineTransport {
    session: Session,
    timers: TickTimers,
    clock: Arc<dyn Clock>,
    events: UnboundedReceiver<Event>,
}

impl InlineTransport {
    pub fn new(module: Box<dyn EngineModule>, config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, events) = unbounded();
        let timers = TickTimers::new(config.tick_interval, config.snapshot_interval, clock.now());
        let session = Session::new(module, config, clock.clone(), EventSink::new(tx));
        Self {
            session,
            timers,
            clock,
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl SessionTransport for InlineTransport {
    fn send(&mut self, command: Command) -> Result<(), ProtocolError> {
        self.session.handle_command(command);
        Ok(())
    }

    fn pump(&mut self) -> Result<(), ProtocolError> {
        self.timers.run_due(&mut self.session, self.clock.now());
        Ok(())
    }

    fn events(&mut self) -> &mut UnboundedReceiver<Event> {
        &mut self.events
    }
}
