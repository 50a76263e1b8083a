//! Packet demultiplexing and dispatch.
//!
//! # Data Flow
//! ```text
//! Selector thread: frame bytes
//!     → Packet::from_bytes (JSON + "type" tag)
//!     → registry lookup (packet type → demultiplexer)
//!     → pool.rs (bounded worker pool, or inline when sized 0)
//!     → PacketDemultiplexer::handle_packet
//!
//! Local sends (destination is this node):
//!     → deliver_local (deep copy, handler runs on the caller's thread)
//! ```
//!
//! # Design Decisions
//! - Registration is design-time wiring: first registration per type wins
//!   and entries are never removed
//! - Unregistered types are dropped at debug level; many demultiplexers
//!   deliberately ignore types outside their concern
//! - Handlers must not block on network I/O. The pool is fixed-size and a
//!   handler waiting on a reply that needs another pool thread can deadlock
//!   it under load. Nothing in the type system enforces this.

pub mod packet;
pub mod pool;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::config::DispatchConfig;
use crate::net::FrameHandler;
use crate::observability::metrics;

pub use packet::{packet_type_of, tagged, Packet, PacketError, PacketType, TYPE_KEY};
pub use pool::WorkerPool;

/// A handler registered against one or more packet types.
pub trait PacketDemultiplexer: Send + Sync {
    /// Handle a decoded message; returns whether it was consumed.
    fn handle_packet(&self, packet: &Packet) -> bool;
}

impl<F> PacketDemultiplexer for F
where
    F: Fn(&Packet) -> bool + Send + Sync,
{
    fn handle_packet(&self, packet: &Packet) -> bool {
        self(packet)
    }
}

/// Maps packet types to demultiplexers and runs them on a worker pool.
pub struct Dispatcher {
    handlers: DashMap<PacketType, Arc<dyn PacketDemultiplexer>>,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            handlers: DashMap::new(),
            pool,
        }
    }

    /// Build a dispatcher with a pool sized by `dispatch.worker_threads`.
    pub fn from_config(config: &DispatchConfig) -> io::Result<Self> {
        Ok(Self::new(WorkerPool::new("ns-dispatch", config.worker_threads)?))
    }

    /// Register `handler` for `packet_type`.
    ///
    /// Returns `false`, leaving the existing handler in place, if the type
    /// is already registered.
    pub fn register(&self, packet_type: PacketType, handler: Arc<dyn PacketDemultiplexer>) -> bool {
        match self.handlers.entry(packet_type) {
            Entry::Occupied(_) => {
                tracing::warn!(packet_type, "Packet type already registered, keeping first handler");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
                tracing::debug!(packet_type, "Packet type registered");
                true
            }
        }
    }

    /// Register one handler for several types; returns how many were newly registered.
    pub fn register_all(&self, types: &[PacketType], handler: Arc<dyn PacketDemultiplexer>) -> usize {
        types
            .iter()
            .filter(|ty| self.register(**ty, Arc::clone(&handler)))
            .count()
    }

    pub fn is_registered(&self, packet_type: PacketType) -> bool {
        self.handlers.contains_key(&packet_type)
    }

    fn handler_for(&self, packet_type: PacketType) -> Option<Arc<dyn PacketDemultiplexer>> {
        self.handlers.get(&packet_type).map(|h| Arc::clone(h.value()))
    }

    /// Schedule `packet` on the worker pool. Returns `false` if no handler
    /// is registered for its type.
    pub fn dispatch(&self, packet: Packet) -> bool {
        let Some(handler) = self.handler_for(packet.packet_type) else {
            tracing::debug!(
                packet_type = packet.packet_type,
                sender = %packet.sender,
                "No handler registered, dropping packet"
            );
            metrics::record_packet("unregistered");
            return false;
        };

        let accepted = self.pool.execute(move || {
            if !handler.handle_packet(&packet) {
                tracing::trace!(packet_type = packet.packet_type, "Packet not consumed by handler");
            }
        });
        metrics::record_packet(if accepted { "dispatched" } else { "stopped" });
        accepted
    }

    /// Shut the worker pool down; packets dispatched afterwards are dropped.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Hand a locally addressed message straight to its handler.
    ///
    /// The message is deep-copied so the caller keeps ownership of its value;
    /// the handler runs synchronously on the calling thread. Returns the
    /// handler's verdict, or `false` if nothing handles the type.
    pub fn deliver_local(&self, sender: SocketAddr, message: &Value) -> bool {
        let packet = match Packet::from_value(sender, message.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping invalid local message");
                metrics::record_packet("invalid");
                return false;
            }
        };

        match self.handler_for(packet.packet_type) {
            Some(handler) => {
                metrics::record_packet("local");
                handler.handle_packet(&packet)
            }
            None => {
                tracing::debug!(packet_type = packet.packet_type, "No handler registered for local packet");
                metrics::record_packet("unregistered");
                false
            }
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, peer: SocketAddr, frame: Vec<u8>) {
        match Packet::from_bytes(peer, &frame) {
            Ok(packet) => {
                self.dispatch(packet);
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, len = frame.len(), "Dropping undecodable frame");
                metrics::record_packet("invalid");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registered", &self.handlers.len())
            .field("pool", &self.pool)
            .finish()
    }
}
