//! Traffic counters and the periodic summary reporter.
//!
//! The data-channel facade feeds bytes into a shared [`ByteCounters`]; a
//! spawned reporter task samples and resets the counters on a fixed
//! interval and logs a summary line together with the current in-flight
//! client count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::tokens::Tokens;

/// Shared byte/connection counters. Cheap to clone.
#[derive(Clone, Default)]
pub struct ByteCounters {
    inner: Arc<CountersInner>,
}

#[derive(Default)]
struct CountersInner {
    /// Bytes relayed from clients toward the relay.
    up: AtomicU64,
    /// Bytes relayed from the relay toward clients.
    down: AtomicU64,
    /// Client sessions completed since the last sample.
    connections: AtomicU64,
}

/// One sampled-and-reset window of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSummary {
    pub up: u64,
    pub down: u64,
    pub connections: u64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_up(&self, n: usize) {
        self.inner.up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: usize) {
        self.inner.down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn connection_done(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the current window, resetting all counters to zero.
    pub fn take(&self) -> TrafficSummary {
        TrafficSummary {
            up: self.inner.up.swap(0, Ordering::Relaxed),
            down: self.inner.down.swap(0, Ordering::Relaxed),
            connections: self.inner.connections.swap(0, Ordering::Relaxed),
        }
    }
}

/// Spawn the periodic summary reporter. Runs until shutdown; an interval
/// of zero disables reporting entirely.
pub(crate) fn spawn_reporter(
    counters: ByteCounters,
    tokens: Tokens,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let summary = counters.take();
            info!(
                connections = summary.connections,
                up_bytes = summary.up,
                down_bytes = summary.down,
                in_flight = tokens.in_flight(),
                "traffic summary for the last {:?}",
                interval,
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let counters = ByteCounters::new();
        counters.add_up(100);
        counters.add_up(50);
        counters.add_down(7);
        counters.connection_done();

        let s = counters.take();
        assert_eq!(s.up, 150);
        assert_eq!(s.down, 7);
        assert_eq!(s.connections, 1);

        // take() resets the window.
        let s = counters.take();
        assert_eq!(
            s,
            TrafficSummary {
                up: 0,
                down: 0,
                connections: 0
            }
        );
    }

    #[test]
    fn clones_share_state() {
        let counters = ByteCounters::new();
        let other = counters.clone();
        other.add_up(42);
        assert_eq!(counters.take().up, 42);
    }
}
