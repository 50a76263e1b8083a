//! Cross-thread handle to the selector.
//!
//! # Responsibilities
//! - Build the listener, TLS context, worker pool and connection manager
//! - Start the `ns-selector` thread
//! - Frame payloads and queue them for the selector
//! - Stop the selector and join it

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::config::{validate_config, ConfigError, TransportConfig};
use crate::dispatch::WorkerPool;
use crate::error::TransportError;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ChannelState, ConnectionManager};
use crate::net::framing::FrameCodec;
use crate::net::selector::{SelectorLoop, SelectorParts, WAKER};
use crate::net::tls::TlsContext;
use crate::net::{listener, FrameHandler};

/// Handle to a running transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<ConnectionManager>,
    codec: FrameCodec,
    local_addr: SocketAddr,
    shutdown: Shutdown,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Bind the listener and start the selector thread. Every complete
    /// frame read from any channel is passed to `handler`.
    ///
    /// The configuration is validated first; an invalid one is rejected
    /// with [`TransportError::Config`] before any socket is opened.
    pub fn start(config: &TransportConfig, handler: Arc<dyn FrameHandler>) -> Result<Self, TransportError> {
        validate_config(config).map_err(ConfigError::Validation)?;
        let codec = FrameCodec::from_config(&config.framing)?;
        let tls = TlsContext::from_config(&config.tls)?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let listener = listener::bind(config)?;
        let local_addr = listener.local_addr()?;
        let tls_pool = WorkerPool::new("ns-tls", config.dispatch.tls_task_threads)?;
        let manager = Arc::new(ConnectionManager::new(&config.connections, Arc::clone(&waker)));
        let shutdown = Shutdown::new();

        let selector = SelectorLoop::new(SelectorParts {
            poll,
            listener,
            manager: Arc::clone(&manager),
            handler,
            codec: codec.clone(),
            tls,
            tls_pool,
            waker,
            shutdown: shutdown.clone(),
            config: config.connections.clone(),
        })?;

        let thread = thread::Builder::new()
            .name("ns-selector".into())
            .spawn(move || selector.run())?;

        tracing::info!(
            address = %local_addr,
            node_id = %config.node.id,
            tls = ?config.tls.mode,
            "Transport started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                manager,
                codec,
                local_addr,
                shutdown,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Frame `payload` and queue it for `addr`.
    ///
    /// Returns `payload.len()` once queued, or `Ok(0)` when the write queue
    /// is full but a channel exists; the caller may retry later.
    pub fn send(&self, addr: SocketAddr, payload: &[u8]) -> Result<usize, TransportError> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Stopped);
        }
        let framed = self.inner.codec.encode(payload);
        let framed_len = framed.len();
        let queued = self.inner.manager.send(addr, framed)?;
        Ok(if queued == framed_len { payload.len() } else { 0 })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.inner.manager.is_connected(addr)
    }

    /// Outbound connect attempts made to `addr`.
    pub fn connect_attempts(&self, addr: SocketAddr) -> u64 {
        self.inner.manager.connect_attempts(addr)
    }

    /// State of the channel mapped to `addr`, if any.
    pub fn channel_state(&self, addr: SocketAddr) -> Option<ChannelState> {
        self.inner.manager.state(addr)
    }

    pub fn queued_sends(&self, addr: SocketAddr) -> usize {
        self.inner.manager.queued_sends(addr)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Stop the selector and wait for it to exit. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl Inner {
    fn stop(&self) {
        if self.shutdown.trigger() {
            tracing::info!(address = %self.local_addr, "Stopping transport");
        }
        self.manager.wake();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Selector thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.inner.local_addr)
            .field("stopped", &self.inner.shutdown.is_triggered())
            .finish()
    }
}
