//! Per-address reconnect throttling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Last connection attempt against one address.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectRecord {
    pub last_attempt: Instant,
    pub attempts: u64,
}

/// Enforces a minimum interval between connection attempts per address.
///
/// Not synchronized; the connection manager keeps it under its own lock so
/// that "check throttle, then connect" is one atomic step.
#[derive(Debug)]
pub struct ReconnectThrottle {
    min_interval: Duration,
    records: HashMap<SocketAddr, ReconnectRecord>,
}

impl ReconnectThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            records: HashMap::new(),
        }
    }

    /// Record an attempt at `now` if the interval has elapsed since the last one.
    pub fn try_acquire(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if !self.allows(addr, now) {
            return false;
        }
        let record = self.records.entry(addr).or_insert(ReconnectRecord {
            last_attempt: now,
            attempts: 0,
        });
        record.last_attempt = now;
        record.attempts += 1;
        true
    }

    /// Whether an attempt at `now` would be allowed.
    pub fn allows(&self, addr: SocketAddr, now: Instant) -> bool {
        match self.records.get(&addr) {
            Some(record) => now.saturating_duration_since(record.last_attempt) >= self.min_interval,
            None => true,
        }
    }

    /// Total attempts recorded against `addr`.
    pub fn attempts(&self, addr: SocketAddr) -> u64 {
        self.records.get(&addr).map_or(0, |r| r.attempts)
    }

    /// Drop records whose interval has elapsed, unless `keep` claims the
    /// address. A dropped record would allow the next attempt anyway.
    pub fn prune(&mut self, now: Instant, mut keep: impl FnMut(SocketAddr) -> bool) {
        let min_interval = self.min_interval;
        self.records.retain(|addr, record| {
            keep(*addr) || now.saturating_duration_since(record.last_attempt) < min_interval
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
