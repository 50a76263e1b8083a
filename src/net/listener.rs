//! Listening socket setup.
//!
//! # Responsibilities
//! - Resolve the bind address (explicit override, own node entry, or an
//!   ephemeral loopback port)
//! - Bind with the configured backlog and buffer hints
//! - Hand a non-blocking mio listener to the selector

use std::io;
use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::net::connection::apply_buffer_hints;

/// Bind the node's listening socket.
pub fn bind(config: &TransportConfig) -> Result<TcpListener, TransportError> {
    let addr = config
        .bind_address()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid listener.bind_address"))?;
    let listener = bind_addr(addr, config.listener.backlog, config.connections.recv_buffer_size)?;

    tracing::info!(
        address = %listener.local_addr()?,
        node_id = %config.node.id,
        backlog = config.listener.backlog,
        "Listener bound"
    );
    Ok(listener)
}

/// Bind a non-blocking listener on `addr`.
pub fn bind_addr(addr: SocketAddr, backlog: i32, recv_buffer_size: Option<usize>) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    // Accepted sockets inherit the receive buffer; it must be set before listen.
    apply_buffer_hints(&socket, None, recv_buffer_size);
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_by_default() {
        let config = TransportConfig::default();
        let listener = bind(&config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn binds_own_node_entry() {
        let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = scratch.local_addr().unwrap().port();
        drop(scratch);

        let mut config = TransportConfig::default();
        config.nodes.insert(config.node.id.clone(), format!("127.0.0.1:{port}"));
        let listener = bind(&config).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn applies_receive_buffer_hint() {
        let listener = bind_addr("127.0.0.1:0".parse().unwrap(), 16, Some(128 * 1024)).unwrap();
        let size = socket2::SockRef::from(&listener).recv_buffer_size().unwrap();
        assert!(size > 0);
    }
}
