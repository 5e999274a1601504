use std::time::Duration;

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval_at, Instant},
};
use tracing::debug;

/// Outcome of one clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    /// Still counting; carries the remaining seconds.
    Running(u64),
    /// The countdown just reached zero. Emitted exactly once.
    Expired,
    /// The clock is stopped; nothing changed.
    Idle,
}

/// Countdown toward the attempt deadline.
///
/// The clock performs no I/O: a [`Ticker`] delivers the ticks and the controller feeds them in.
#[derive(Debug, Default)]
pub struct Clock {
    remaining: u64,
    running: bool,
    expired: bool,
}

impl Clock {
    /// Create a stopped clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin counting down from `initial_seconds`.
    ///
    /// Starting at zero expires on the first tick. A clock that already expired stays expired.
    pub fn start(&mut self, initial_seconds: u64) {
        if self.expired {
            return;
        }
        self.remaining = initial_seconds;
        self.running = true;
    }

    /// Stop counting. Idempotent; ticks are ignored afterwards.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Seconds left.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the clock is counting.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Remove one second.
    pub fn tick(&mut self) -> ClockTick {
        if !self.running {
            return ClockTick::Idle;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.running = false;
            self.expired = true;
            return ClockTick::Expired;
        }
        ClockTick::Running(self.remaining)
    }

    /// Adopt the server's view of the remaining time after a connectivity gap.
    ///
    /// The countdown never moves backwards: a server value above the local one is ignored.
    /// A server value of zero expires the clock immediately.
    pub fn resync(&mut self, server_seconds: u64) -> ClockTick {
        if !self.running {
            return ClockTick::Idle;
        }
        if server_seconds < self.remaining {
            debug!(
                local = self.remaining,
                server = server_seconds,
                "clock resynchronized from server"
            );
            self.remaining = server_seconds;
        }
        if self.remaining == 0 {
            self.running = false;
            self.expired = true;
            return ClockTick::Expired;
        }
        ClockTick::Running(self.remaining)
    }
}

/// Background task delivering a message into the controller mailbox at a fixed period.
#[derive(Debug)]
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn a ticker that sends `make()` every `period`, first after one full period.
    pub fn spawn<T, F>(period: Duration, tx: mpsc::UnboundedSender<T>, make: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stop delivering. Idempotent.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
