//! Stepping and broadcast deadlines shared by both transports

use std::time::Duration;

use crate::simulation::session::Session;

/// Which periodic passes are due
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub step: bool,
    pub snapshot: bool,
}

/// Two fixed-period deadlines. A late timer fires once and re-arms from the
/// current time; missed periods are not replayed.
#[derive(Debug, Clone)]
pub struct TickTimers {
    tick_interval: Duration,
    snapshot_interval: Duration,
    next_tick: Duration,
    next_snapshot: Duration,
}

impl TickTimers {
    pub fn new(tick_interval: Duration, snapshot_interval: Duration, now: Duration) -> Self {
        Self {
            tick_interval,
            snapshot_interval,
            next_tick: now + tick_interval,
            next_snapshot: now + snapshot_interval,
        }
    }

    pub fn poll(&mut self, now: Duration) -> Due {
        let mut due = Due::default();
        if now >= self.next_tick {
            due.step = true;
            self.next_tick = now + self.tick_interval;
        }
        if now >= self.next_snapshot {
            due.snapshot = true;
            self.next_snapshot = now + self.snapshot_interval;
        }
        due
    }

    /// Time left until the earliest deadline
    pub fn until_next(&self, now: Duration) -> Duration {
        self.next_tick.min(self.next_snapshot).saturating_sub(now)
    }

    /// Run whatever is due against `session`
    pub fn run_due(&mut self, session: &mut Session, now: Duration) -> Due {
        let due = self.poll(now);
        if due.step {
            session.tick();
        }
        if due.snapshot {
            session.broadcast();
        }
        due
    }
}
