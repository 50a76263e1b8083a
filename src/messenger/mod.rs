//! Messenger facade over the transport and dispatch registry.
//!
//! # Data Flow
//! ```text
//! send_to_id(id, msg)
//!     → NodeResolver (id → address)
//!     → send_to_address(addr, msg)
//!         local address → Dispatcher::deliver_local (synchronous)
//!         remote        → serde_json → Transport::send
//!             full     → done
//!             partial  → retransmit.rs (exponential backoff until accepted)
//!             error    → logged, returned to the caller
//! ```
//!
//! # Design Decisions
//! - Structured messages are JSON objects with an integer `"type"` field
//! - Retransmission runs on its own small runtime so callers never sleep

pub mod resolver;
pub mod retransmit;

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;

use crate::config::TransportConfig;
use crate::dispatch::{Dispatcher, PacketDemultiplexer, PacketType};
use crate::error::TransportError;
use crate::lifecycle::Shutdown;
use crate::net::{FrameHandler, Transport};
use crate::resilience::RetransmitPolicy;

pub use resolver::{NodeResolver, StaticResolver};
pub use retransmit::Retransmitter;

/// Entry point for upper layers: send structured messages, receive them
/// through registered demultiplexers.
pub struct Messenger<R: NodeResolver = StaticResolver> {
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    node_id: String,
    own_address: Option<SocketAddr>,
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    resolver: R,
    retransmitter: Retransmitter,
    shutdown: Shutdown,
}

impl<R: NodeResolver> Clone for Messenger<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: NodeResolver> Messenger<R> {
    /// Start the transport for `config.node.id` and resolve peers with `resolver`.
    pub fn start(config: &TransportConfig, resolver: R) -> Result<Self, TransportError> {
        let dispatcher = Arc::new(Dispatcher::from_config(&config.dispatch)?);
        let handler: Arc<dyn FrameHandler> = dispatcher.clone();
        let transport = Transport::start(config, handler)?;
        let shutdown = Shutdown::new();
        let retransmitter = Retransmitter::new(RetransmitPolicy::new(&config.retransmit), shutdown.clone())?;

        tracing::info!(
            node_id = %config.node.id,
            address = %transport.local_addr(),
            "Messenger started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                node_id: config.node.id.clone(),
                own_address: config.node_address(&config.node.id),
                transport,
                dispatcher,
                resolver,
                retransmitter,
                shutdown,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn resolver(&self) -> &R {
        &self.inner.resolver
    }

    /// Retransmissions still waiting to be accepted.
    pub fn pending_retransmissions(&self) -> usize {
        self.inner.retransmitter.in_flight()
    }

    /// Register `handler` for one packet type; the first registration wins.
    pub fn register_packet_type(&self, packet_type: PacketType, handler: Arc<dyn PacketDemultiplexer>) -> bool {
        self.inner.dispatcher.register(packet_type, handler)
    }

    /// Register `handler` for every type in `types`; returns how many were new.
    pub fn register_demultiplexer(&self, types: &[PacketType], handler: Arc<dyn PacketDemultiplexer>) -> usize {
        self.inner.dispatcher.register_all(types, handler)
    }

    /// Send `message` to the node `id`.
    pub fn send_to_id(&self, id: &str, message: &Value) -> Result<usize, TransportError> {
        let addr = self
            .inner
            .resolver
            .resolve(id)
            .ok_or_else(|| TransportError::UnknownNode(id.to_string()))?;
        self.send_to_address(addr, message)
    }

    /// Send `message` to `addr`.
    ///
    /// Returns the serialized length when the message was accepted in full.
    /// A shorter count means the transport was congested and a
    /// retransmission has been scheduled.
    pub fn send_to_address(&self, addr: SocketAddr, message: &Value) -> Result<usize, TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Stopped);
        }
        let bytes = serde_json::to_vec(message)?;

        if self.is_local(addr) {
            if !self.inner.dispatcher.deliver_local(self.local_addr(), message) {
                tracing::debug!(peer = %addr, "Local message not consumed");
            }
            return Ok(bytes.len());
        }

        match self.inner.transport.send(addr, &bytes) {
            Ok(sent) if sent == bytes.len() => Ok(sent),
            Ok(sent) => {
                tracing::debug!(peer = %addr, sent, len = bytes.len(), "Send congested, retransmitting");
                self.inner
                    .retransmitter
                    .schedule(self.inner.transport.clone(), addr, Arc::new(bytes));
                Ok(sent)
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Send failed, dropping message");
                Err(e)
            }
        }
    }

    fn is_local(&self, addr: SocketAddr) -> bool {
        self.inner.own_address == Some(addr) || self.local_addr() == addr
    }

    /// Stop retransmissions, the transport and the handler pool. Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.trigger() {
            tracing::info!(node_id = %self.inner.node_id, "Stopping messenger");
        }
        self.inner.transport.stop();
        self.inner.dispatcher.shutdown();
    }
}

impl<R: NodeResolver> std::fmt::Debug for Messenger<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("node_id", &self.inner.node_id)
            .field("transport", &self.inner.transport)
            .finish()
    }
}
