//! Whitespace keepalive for idle streams.

use core::future::Future;
use core::time::Duration;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Error;

/// Payload written when the connection has been idle for too long.
pub(crate) const WHITESPACE_PING: &str = " ";

/// Keepalive timing.
///
/// After `initial_delay`, the idle counter is decremented once per `tick`.
/// When it drops below zero a whitespace ping is sent. Every successful
/// send resets the counter to `idle_ticks`, so a busy connection never
/// pings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    enabled: bool,
    initial_delay: Duration,
    tick: Duration,
    idle_ticks: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(10),
            tick: Duration::from_secs(2),
            idle_ticks: 10,
        }
    }
}

impl KeepAlive {
    /// No keepalive task at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Grace period before the first tick.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Interval between two ticks.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Number of idle ticks tolerated before pinging.
    pub fn with_idle_ticks(mut self, ticks: u32) -> Self {
        self.idle_ticks = ticks;
        self
    }

    /// Whether a keepalive task should be started.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn counter(&self) -> IdleCounter {
        IdleCounter::new(self.idle_ticks)
    }

    /// Run the tick loop, calling `ping` whenever `idle` runs out.
    ///
    /// Only returns once a ping failed, with that failure.
    pub(crate) async fn run<F, Fut>(self, idle: &IdleCounter, mut ping: F) -> Error
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        tokio::time::sleep(self.initial_delay).await;
        loop {
            tokio::time::sleep(self.tick).await;
            if !idle.tick() {
                continue;
            }
            log::trace!("idle for {} ticks, sending whitespace ping", self.idle_ticks);
            if let Err(e) = ping().await {
                return e;
            }
            idle.reset();
        }
    }
}

/// Ticks left until the next keepalive ping.
#[derive(Debug)]
pub(crate) struct IdleCounter {
    ticks: i64,
    remaining: AtomicI64,
}

impl IdleCounter {
    pub(crate) fn new(ticks: u32) -> Self {
        Self {
            ticks: i64::from(ticks),
            remaining: AtomicI64::new(i64::from(ticks)),
        }
    }

    pub(crate) fn reset(&self) {
        self.remaining.store(self.ticks, Ordering::Relaxed);
    }

    /// Count one tick. Returns true once the counter went negative.
    pub(crate) fn tick(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::Relaxed) - 1 < 0
    }
}
