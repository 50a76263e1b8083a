//! Address→channel map, write queues and pending connects.
//!
//! # Responsibilities
//! - Map each remote address to at most one live channel
//! - Queue framed buffers per address until the selector writes them
//! - Initiate outbound connects on demand, throttled per address
//! - Hand new streams and write-interest requests to the selector
//!
//! # Design Decisions
//! - All shared state sits behind one mutex; each check-then-act (entry
//!   lookup, throttle test, connect, enqueue) happens under one acquisition
//! - Callers never touch sockets' interest sets; they record a request and
//!   wake the selector
//! - Queues are keyed by address, not channel, so queued data survives a
//!   reconnect in order
//! - Accepted peers connect from ephemeral ports nobody listens on. When an
//!   accepted channel closes its queue is dropped and the address is
//!   remembered for a while so late replies fail fast instead of dialing
//! - Empty queues and stale throttle records are pruned as channels close

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Token, Waker};
use parking_lot::Mutex;
use socket2::SockRef;

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::observability::metrics;
use crate::resilience::ReconnectThrottle;

/// How long a closed inbound peer's address refuses sends.
const DEPARTED_RETENTION: Duration = Duration::from_secs(60);

/// Relaxed ordering is enough; ids only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a channel; doubles as its selector token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn token(&self) -> Token {
        Token(self.0 as usize)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
struct ChannelEntry {
    id: ConnectionId,
    state: ChannelState,
    /// Accepted from the peer rather than dialed.
    inbound: bool,
}

/// A non-blocking connect waiting for selector registration.
#[derive(Debug)]
pub struct PendingConnect {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub stream: TcpStream,
}

#[derive(Debug)]
struct Shared {
    channels: HashMap<SocketAddr, ChannelEntry>,
    pending_writes: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
    pending_connects: Vec<PendingConnect>,
    interest_changes: HashSet<SocketAddr>,
    throttle: ReconnectThrottle,
    /// Closed inbound peers and when they left.
    departed: HashMap<SocketAddr, Instant>,
}

impl Shared {
    fn has_departed(&self, addr: SocketAddr, now: Instant) -> bool {
        self.departed
            .get(&addr)
            .is_some_and(|left| now.saturating_duration_since(*left) < DEPARTED_RETENTION)
    }

    /// Forget empty queues, expired departures and throttle records of
    /// addresses nothing refers to any more.
    fn prune(&mut self, now: Instant) {
        self.pending_writes.retain(|_, queue| !queue.is_empty());
        self.departed
            .retain(|_, left| now.saturating_duration_since(*left) < DEPARTED_RETENTION);
        let Shared {
            channels,
            pending_writes,
            throttle,
            ..
        } = self;
        throttle.prune(now, |addr| channels.contains_key(&addr) || pending_writes.contains_key(&addr));
    }
}

/// State shared between caller threads and the selector thread.
pub struct ConnectionManager {
    shared: Mutex<Shared>,
    waker: Arc<Waker>,
    max_queued_sends: usize,
    send_buffer_size: Option<usize>,
    recv_buffer_size: Option<usize>,
}

impl ConnectionManager {
    pub fn new(config: &ConnectionConfig, waker: Arc<Waker>) -> Self {
        Self {
            shared: Mutex::new(Shared {
                channels: HashMap::new(),
                pending_writes: HashMap::new(),
                pending_connects: Vec::new(),
                interest_changes: HashSet::new(),
                throttle: ReconnectThrottle::new(config.min_reconnect_interval()),
                departed: HashMap::new(),
            }),
            waker,
            max_queued_sends: config.max_queued_sends,
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
        }
    }

    /// Queue an already framed buffer for `addr`, connecting if needed.
    ///
    /// Returns the number of bytes queued. When the queue is full the buffer
    /// is dropped: `Ok(0)` if a channel exists (congestion), otherwise
    /// `Err(Unreachable)`. Sends to a recently closed inbound peer are
    /// dropped with `Err(Unreachable)`.
    pub fn send(&self, addr: SocketAddr, framed: Vec<u8>) -> Result<usize, TransportError> {
        let len = framed.len();
        let result = {
            let mut shared = self.shared.lock();
            if !shared.channels.contains_key(&addr) && shared.has_departed(addr, Instant::now()) {
                metrics::record_send_dropped("peer_departed");
                tracing::debug!(peer = %addr, "Inbound peer has disconnected, dropping send");
                return Err(TransportError::Unreachable(addr));
            }
            let has_entry = shared.channels.contains_key(&addr) || self.initiate_connect(&mut shared, addr);

            let queue = shared.pending_writes.entry(addr).or_default();
            if queue.len() >= self.max_queued_sends {
                metrics::record_send_dropped("queue_full");
                tracing::warn!(peer = %addr, queued = queue.len(), "Write queue full, dropping send");
                if has_entry {
                    Ok(0)
                } else {
                    Err(TransportError::Unreachable(addr))
                }
            } else {
                queue.push_back(framed);
                shared.interest_changes.insert(addr);
                Ok(len)
            }
        };
        self.wake();
        result
    }

    /// Test the throttle and start a connect. Caller holds the lock.
    fn initiate_connect(&self, shared: &mut Shared, addr: SocketAddr) -> bool {
        if !shared.throttle.try_acquire(addr, Instant::now()) {
            tracing::debug!(peer = %addr, "Reconnect throttled");
            return false;
        }
        metrics::record_connect_attempt();

        match TcpStream::connect(addr) {
            Ok(stream) => {
                apply_buffer_hints(&stream, self.send_buffer_size, self.recv_buffer_size);
                let id = ConnectionId::new();
                shared.channels.insert(
                    addr,
                    ChannelEntry {
                        id,
                        state: ChannelState::Connecting,
                        inbound: false,
                    },
                );
                shared.pending_connects.push(PendingConnect { id, addr, stream });
                tracing::debug!(peer = %addr, connection_id = %id, "Connect initiated");
                true
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Connect failed");
                false
            }
        }
    }

    /// Record an accepted channel. With duplex reuse it becomes the channel
    /// for `peer`, replacing any previous entry.
    pub fn register_inbound(&self, peer: SocketAddr, id: ConnectionId, duplex: bool) {
        if !duplex {
            return;
        }
        let mut shared = self.shared.lock();
        let previous = shared.channels.insert(
            peer,
            ChannelEntry {
                id,
                state: ChannelState::Connected,
                inbound: true,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(peer = %peer, replaced = %previous.id, connection_id = %id, "Inbound channel replaces entry");
        }
        if shared.pending_writes.get(&peer).is_some_and(|q| !q.is_empty()) {
            shared.interest_changes.insert(peer);
        }
    }

    /// Returns false if `addr` is no longer mapped to `id`.
    pub fn mark_connected(&self, addr: SocketAddr, id: ConnectionId) -> bool {
        let mut shared = self.shared.lock();
        match shared.channels.get_mut(&addr) {
            Some(entry) if entry.id == id => {
                entry.state = ChannelState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry for `addr` if it still refers to `id`.
    ///
    /// Queued data for a dialed address is kept for the next channel. An
    /// accepted peer cannot be dialed back, so its queue is dropped.
    pub fn channel_closed(&self, addr: SocketAddr, id: ConnectionId) -> bool {
        let now = Instant::now();
        let mut shared = self.shared.lock();
        let current = shared.channels.get(&addr).is_some_and(|entry| entry.id == id);
        if current {
            let inbound = shared.channels.remove(&addr).is_some_and(|entry| entry.inbound);
            if inbound {
                shared.interest_changes.remove(&addr);
                shared.departed.insert(addr, now);
                let dropped = shared.pending_writes.remove(&addr).map_or(0, |q| q.len());
                if dropped > 0 {
                    metrics::record_send_dropped("peer_departed");
                    tracing::warn!(peer = %addr, dropped, "Inbound peer closed, dropping queued sends");
                }
            }
        }
        shared.prune(now);
        current
    }

    /// Reconnect after a failure, if data is waiting and the throttle allows.
    pub fn retry_connect(&self, addr: SocketAddr) -> bool {
        let started = {
            let mut shared = self.shared.lock();
            let queued = shared.pending_writes.get(&addr).is_some_and(|q| !q.is_empty());
            if shared.channels.contains_key(&addr) || !queued {
                false
            } else {
                self.initiate_connect(&mut shared, addr)
            }
        };
        if started {
            tracing::info!(peer = %addr, "Reconnecting with queued data");
            self.wake();
        }
        started
    }

    /// Take the next buffer for `addr`; an emptied queue is removed.
    pub fn pop_write(&self, addr: SocketAddr) -> Option<Vec<u8>> {
        let mut shared = self.shared.lock();
        let queue = shared.pending_writes.get_mut(&addr)?;
        let buf = queue.pop_front();
        if queue.is_empty() {
            shared.pending_writes.remove(&addr);
        }
        buf
    }

    /// Put back the unwritten remainder of a buffer.
    pub fn push_front(&self, addr: SocketAddr, rest: Vec<u8>) {
        self.shared
            .lock()
            .pending_writes
            .entry(addr)
            .or_default()
            .push_front(rest);
    }

    pub fn has_pending(&self, addr: SocketAddr) -> bool {
        self.queued_sends(addr) > 0
    }

    pub fn take_pending_connects(&self) -> Vec<PendingConnect> {
        std::mem::take(&mut self.shared.lock().pending_connects)
    }

    /// Drain write-interest requests, resolved to connected channel ids.
    /// Requests for connecting or unmapped addresses are dropped; connect
    /// completion and the next connect pick those up.
    pub fn take_interest_changes(&self) -> Vec<(SocketAddr, ConnectionId)> {
        let mut shared = self.shared.lock();
        let changes = std::mem::take(&mut shared.interest_changes);
        changes
            .into_iter()
            .filter_map(|addr| match shared.channels.get(&addr) {
                Some(entry) if entry.state == ChannelState::Connected => Some((addr, entry.id)),
                _ => None,
            })
            .collect()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.state(addr) == Some(ChannelState::Connected)
    }

    pub fn state(&self, addr: SocketAddr) -> Option<ChannelState> {
        self.shared.lock().channels.get(&addr).map(|e| e.state)
    }

    pub fn connect_attempts(&self, addr: SocketAddr) -> u64 {
        self.shared.lock().throttle.attempts(addr)
    }

    pub fn queued_sends(&self, addr: SocketAddr) -> usize {
        self.shared.lock().pending_writes.get(&addr).map_or(0, VecDeque::len)
    }

    /// Drop every entry, queue and pending connect.
    pub fn clear(&self) {
        let mut shared = self.shared.lock();
        shared.channels.clear();
        shared.pending_writes.clear();
        shared.pending_connects.clear();
        shared.interest_changes.clear();
        shared.departed.clear();
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "Failed to wake selector");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("channels", &shared.channels.len())
            .field("pending_connects", &shared.pending_connects.len())
            .field("queued_addresses", &shared.pending_writes.len())
            .field("max_queued_sends", &self.max_queued_sends)
            .finish()
    }
}

/// Apply socket buffer size hints; failures are logged, not fatal.
pub fn apply_buffer_hints<S>(socket: &S, send: Option<usize>, recv: Option<usize>)
where
    for<'s> SockRef<'s>: From<&'s S>,
{
    let sock = SockRef::from(socket);
    if let Some(size) = send {
        if let Err(e) = sock.set_send_buffer_size(size) {
            tracing::debug!(size, error = %e, "Could not set send buffer size");
        }
    }
    if let Some(size) = recv {
        if let Err(e) = sock.set_recv_buffer_size(size) {
            tracing::debug!(size, error = %e, "Could not set receive buffer size");
        }
    }
}
