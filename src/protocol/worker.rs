//! Session driven on a dedicated thread

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::StreamExt;
use log::{debug, error};

use super::command::Command;
use super::event::{Event, EventSink};
use super::timers::TickTimers;
use super::transport::SessionTransport;
use super::ProtocolError;
use crate::bridge::EngineModule;
use crate::config::SessionConfig;
use crate::simulation::clock::Clock;
use crate::simulation::session::Session;

enum Control {
    Command(Command),
    Shutdown,
}

/// Owns a thread that exclusively owns the engine module and session.
///
/// Dropping the transport stops the thread and frees the loaded model.
pub struct WorkerTransport {
    commands: mpsc::Sender<Control>,
    events: UnboundedReceiver<Event>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerTransport {
    /// Start a worker whose engine module is built on the worker thread
    pub fn spawn<F>(make_module: F, config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self, ProtocolError>
    where
        F: FnOnce() -> Box<dyn EngineModule> + Send + 'static,
    {
        let (commands, inbox) = mpsc::channel();
        let (tx, events) = unbounded();
        let thread = thread::Builder::new()
            .name("forgebridge-session".into())
            .spawn(move || {
                let mut timers = TickTimers::new(config.tick_interval, config.snapshot_interval, clock.now());
                let mut session = Session::new(make_module(), config, clock.clone(), EventSink::new(tx));
                run(&mut session, &mut timers, clock.as_ref(), &inbox);
                session.shutdown();
                debug!("session worker stopped");
            })?;
        Ok(Self {
            commands,
            events,
            thread: Some(thread),
        })
    }

    /// Start a worker around an already-built module
    pub fn with_module(module: Box<dyn EngineModule>, config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self, ProtocolError> {
        Self::spawn(move || module, config, clock)
    }

    /// Block until the next event, `None` once the worker has stopped and
    /// every event has been drained
    pub fn recv_blocking(&mut self) -> Option<Event> {
        pollster::block_on(self.events.next())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Control::Shutdown);
            if thread.join().is_err() {
                error!("session worker panicked");
            }
        }
    }
}

fn run(session: &mut Session, timers: &mut TickTimers, clock: &dyn Clock, inbox: &mpsc::Receiver<Control>) {
    loop {
        match inbox.recv_timeout(timers.until_next(clock.now())) {
            Ok(Control::Command(command)) => session.handle_command(command),
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        timers.run_due(session, clock.now());
    }
}

impl SessionTransport for WorkerTransport {
    fn send(&mut self, command: Command) -> Result<(), ProtocolError> {
        if self.thread.as_ref().map_or(true, JoinHandle::is_finished) {
            return Err(ProtocolError::Closed);
        }
        self.commands
            .send(Control::Command(command))
            .map_err(|_| ProtocolError::Closed)
    }

    fn pump(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn events(&mut self) -> &mut UnboundedReceiver<Event> {
        &mut self.events
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
