//! Non-blocking network transport for a distributed name service.
//!
//! One selector thread multiplexes every connection, frames the byte stream
//! into messages, optionally terminates TLS in user space, and hands each
//! decoded message to a handler chosen by its integer packet type.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod messenger;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::schema::TransportConfig;
pub use dispatch::{Dispatcher, Packet, PacketDemultiplexer, PacketType};
pub use error::{TransportError, TransportResult};
pub use lifecycle::Shutdown;
pub use messenger::{Messenger, NodeResolver, StaticResolver};
pub use net::{FrameCodec, FrameHandler, Transport};
