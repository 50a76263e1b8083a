//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Caller thread: Transport::send(addr, payload)
//!     → framing.rs (DELIM len DELIM payload)
//!     → connection.rs (write queue per address, connect on demand)
//!     → wake selector
//!
//! Selector thread (selector.rs):
//!     listener.rs socket → accept → channel
//!     channel readable → tls/ (optional unwrap) → framing.rs decoder
//!     → FrameHandler::on_frame (dispatch registry)
//!
//! Channel states:
//!     Connecting → Connected → Closed
//! ```
//!
//! # Design Decisions
//! - One thread owns every socket; other threads only enqueue and wake it
//! - TLS is optional and handled transparently inside the channel
//! - A failure closes one channel, never the loop

pub mod connection;
pub mod framing;
pub mod listener;
pub mod selector;
pub mod tls;
pub mod transport;

use std::net::SocketAddr;

pub use connection::{ChannelState, ConnectionId, ConnectionManager};
pub use framing::{FrameCodec, FrameDecoder};
pub use tls::{TlsContext, TlsError};
pub use transport::Transport;

/// Receives every complete frame read by the selector.
///
/// Called on the selector thread; implementations must hand work off
/// rather than block.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, peer: SocketAddr, frame: Vec<u8>);
}
