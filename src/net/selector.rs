//! The selector thread.
//!
//! # Data Flow
//! ```text
//! every iteration:
//!     interest changes   → try to write queued data for connected channels
//!     pending connects   → register new outbound streams (read + write)
//!     TLS completions    → hand engines back and continue their handshakes
//!     poll(select_timeout)
//!     events:
//!         listener       → accept until WouldBlock
//!         connecting     → finish connect, start TLS, write
//!         readable       → read until WouldBlock → TLS unwrap / frame decoder → FrameHandler
//!         writable       → drain the address's queue (through TLS if enabled)
//! ```
//!
//! # Design Decisions
//! - Only this thread touches channels and their interest sets
//! - Sockets are edge-triggered; every read and write loop runs until
//!   `WouldBlock` or until there is nothing left to do
//! - A failing channel is torn down and logged; the loop keeps running

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::ConnectionConfig;
use crate::dispatch::WorkerPool;
use crate::lifecycle::Shutdown;
use crate::net::connection::{apply_buffer_hints, ConnectionId, ConnectionManager};
use crate::net::framing::{FrameCodec, FrameDecoder};
use crate::net::tls::{CompletedTask, DelegatedTask, DriveOutcome, TlsContext, TlsError, TlsIo, TlsSession};
use crate::net::FrameHandler;
use crate::observability::metrics;

pub const LISTENER: Token = Token(usize::MAX);
pub const WAKER: Token = Token(usize::MAX - 1);

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Why a channel is being torn down.
#[derive(Debug)]
enum Fault {
    Eof,
    Io(io::Error),
    Tls(TlsError),
}

impl Fault {
    /// Connectivity failures reconnect if data is waiting.
    fn retries(&self) -> bool {
        matches!(self, Fault::Io(_))
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        Fault::Io(e)
    }
}

struct Channel {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    direction: Direction,
    connecting: bool,
    interest: Interest,
    decoder: FrameDecoder,
    tls: Option<TlsSession>,
    /// Records produced by the TLS session and not yet written.
    cipher_out: Vec<u8>,
}

impl Channel {
    /// Counted in the active-connection gauge: accepted, or connected
    /// outbound. A dial that never completed was never counted.
    fn is_counted(&self) -> bool {
        !self.connecting
    }
}

struct TaskCompletion {
    token: Token,
    id: ConnectionId,
    done: CompletedTask,
}

/// Collects the session driver's callbacks for one channel.
struct ChannelIo<'a> {
    cipher_out: &'a mut Vec<u8>,
    decoder: &'a mut FrameDecoder,
    frames: Vec<Vec<u8>>,
    handshake_complete: bool,
    tasks: Vec<DelegatedTask>,
}

impl TlsIo for ChannelIo<'_> {
    fn on_outbound(&mut self, ciphertext: &[u8]) {
        self.cipher_out.extend_from_slice(ciphertext);
    }

    fn on_inbound(&mut self, plaintext: &[u8]) {
        let frames = self.decoder.process_data(plaintext);
        self.frames.extend(frames);
    }

    fn on_handshake_complete(&mut self) {
        self.handshake_complete = true;
    }

    fn submit_task(&mut self, task: DelegatedTask) {
        self.tasks.push(task);
    }
}

pub struct SelectorLoop {
    poll: Poll,
    listener: TcpListener,
    channels: HashMap<Token, Channel>,
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn FrameHandler>,
    codec: FrameCodec,
    tls: Option<TlsContext>,
    tls_pool: WorkerPool,
    completions_tx: Sender<TaskCompletion>,
    completions_rx: Receiver<TaskCompletion>,
    waker: Arc<Waker>,
    shutdown: Shutdown,
    scratch: Vec<u8>,
    config: ConnectionConfig,
}

pub struct SelectorParts {
    pub poll: Poll,
    pub listener: TcpListener,
    pub manager: Arc<ConnectionManager>,
    pub handler: Arc<dyn FrameHandler>,
    pub codec: FrameCodec,
    pub tls: Option<TlsContext>,
    pub tls_pool: WorkerPool,
    pub waker: Arc<Waker>,
    pub shutdown: Shutdown,
    pub config: ConnectionConfig,
}

impl SelectorLoop {
    pub fn new(parts: SelectorParts) -> io::Result<Self> {
        let SelectorParts {
            poll,
            mut listener,
            manager,
            handler,
            codec,
            tls,
            tls_pool,
            waker,
            shutdown,
            config,
        } = parts;

        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let (completions_tx, completions_rx) = mpsc::channel();

        Ok(Self {
            poll,
            listener,
            channels: HashMap::new(),
            manager,
            handler,
            codec,
            tls,
            tls_pool,
            completions_tx,
            completions_rx,
            waker,
            shutdown,
            scratch: vec![0; config.read_buffer_size.max(1)],
            config,
        })
    }

    /// Run until the shutdown flag is set, then close every channel.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let timeout = self.config.select_timeout();
        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Selector loop started");

        while !self.shutdown.is_triggered() {
            self.apply_interest_changes();
            self.apply_pending_connects();
            self.apply_task_completions();

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "Selector poll failed, stopping");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.channel_event(token, event),
                }
            }
        }

        self.close_all();
    }

    fn apply_interest_changes(&mut self) {
        for (addr, id) in self.manager.take_interest_changes() {
            let token = id.token();
            match self.channels.get(&token) {
                Some(channel) if channel.id == id && !channel.connecting => {}
                _ => continue,
            }
            if let Err(fault) = self.write(token) {
                tracing::debug!(peer = %addr, "Write after interest change failed");
                self.cleanup(token, fault);
            }
        }
    }

    fn apply_pending_connects(&mut self) {
        for pending in self.manager.take_pending_connects() {
            let mut stream = pending.stream;
            let token = pending.id.token();
            let interest = Interest::READABLE | Interest::WRITABLE;
            if let Err(e) = self.poll.registry().register(&mut stream, token, interest) {
                tracing::warn!(peer = %pending.addr, error = %e, "Failed to register connect");
                self.manager.channel_closed(pending.addr, pending.id);
                continue;
            }
            self.channels.insert(
                token,
                Channel {
                    id: pending.id,
                    stream,
                    peer: pending.addr,
                    direction: Direction::Outbound,
                    connecting: true,
                    interest,
                    decoder: self.codec.decoder(),
                    tls: None,
                    cipher_out: Vec::new(),
                },
            );
        }
    }

    fn apply_task_completions(&mut self) {
        while let Ok(TaskCompletion { token, id, done }) = self.completions_rx.try_recv() {
            if !self.channels.get(&token).is_some_and(|c| c.id == id) {
                tracing::trace!(connection_id = %id, "TLS task finished for a closed channel");
                continue;
            }
            let result = self
                .drive_tls(token, move |session, io| session.complete_task(done, io))
                .and_then(|()| self.write(token));
            if let Err(fault) = result {
                self.cleanup(token, fault);
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_accepted(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn register_accepted(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new();
        let token = id.token();

        let tls = match self.tls.as_ref().map(TlsContext::server_session).transpose() {
            Ok(tls) => tls,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to create TLS session, dropping connection");
                return;
            }
        };
        self.configure_stream(&stream);
        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            tracing::warn!(peer = %peer, error = %e, "Failed to register accepted connection");
            return;
        }

        self.channels.insert(
            token,
            Channel {
                id,
                stream,
                peer,
                direction: Direction::Inbound,
                connecting: false,
                interest: Interest::READABLE,
                decoder: self.codec.decoder(),
                tls,
                cipher_out: Vec::new(),
            },
        );
        self.manager.register_inbound(peer, id, self.config.duplex_reuse);
        metrics::record_connection_opened(Direction::Inbound.as_str());
        tracing::debug!(peer = %peer, connection_id = %id, "Connection accepted");
    }

    fn configure_stream(&self, stream: &TcpStream) {
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Could not set TCP_NODELAY");
            }
        }
        apply_buffer_hints(stream, self.config.send_buffer_size, None);
    }

    fn channel_event(&mut self, token: Token, event: &Event) {
        let Some(channel) = self.channels.get(&token) else {
            return;
        };
        let failed = event.is_error() || event.is_write_closed();

        let result = if channel.connecting {
            if event.is_writable() || event.is_readable() || failed {
                self.finish_connect(token)
            } else {
                Ok(())
            }
        } else {
            let mut result = Ok(());
            if event.is_readable() || event.is_read_closed() || failed {
                result = self.read(token);
            }
            if result.is_ok() && event.is_writable() {
                result = self.write(token);
            }
            result
        };

        if let Err(fault) = result {
            self.cleanup(token, fault);
        }
    }

    fn finish_connect(&mut self, token: Token) -> Result<(), Fault> {
        let Some(channel) = self.channels.get_mut(&token) else {
            return Ok(());
        };
        if let Some(e) = channel.stream.take_error()? {
            return Err(Fault::Io(e));
        }
        match channel.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(Fault::Io(e)),
        }

        channel.connecting = false;
        let (id, peer) = (channel.id, channel.peer);
        self.configure_stream(&self.channels[&token].stream);
        if !self.manager.mark_connected(peer, id) {
            tracing::debug!(peer = %peer, connection_id = %id, "Connected channel was superseded");
        }
        metrics::record_connection_opened(Direction::Outbound.as_str());
        tracing::info!(peer = %peer, connection_id = %id, "Connected");

        if let Some(ctx) = &self.tls {
            let session = ctx.client_session(peer).map_err(Fault::Tls)?;
            if let Some(channel) = self.channels.get_mut(&token) {
                channel.tls = Some(session);
            }
            self.drive_tls(token, |session, io| session.drive(io))?;
        }
        self.write(token)
    }

    fn read(&mut self, token: Token) -> Result<(), Fault> {
        loop {
            let Some(channel) = self.channels.get_mut(&token) else {
                return Ok(());
            };
            let n = match channel.stream.read(&mut self.scratch) {
                Ok(0) => return Err(Fault::Eof),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::Io(e)),
            };
            metrics::record_bytes_received(n);

            if let Some(session) = channel.tls.as_mut() {
                session.queue_ciphertext(&self.scratch[..n]);
                self.drive_tls(token, |session, io| session.drive(io))?;
                self.write(token)?;
            } else {
                let peer = channel.peer;
                let frames = channel.decoder.process_data(&self.scratch[..n]);
                self.deliver(peer, frames);
            }
        }
    }

    fn deliver(&self, peer: SocketAddr, frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        metrics::record_frames_decoded(frames.len());
        for frame in frames {
            self.handler.on_frame(peer, frame);
        }
    }

    /// Run `f` against a channel's TLS session and act on what it asked for.
    fn drive_tls<F>(&mut self, token: Token, f: F) -> Result<(), Fault>
    where
        F: FnOnce(&mut TlsSession, &mut dyn TlsIo) -> Result<DriveOutcome, TlsError>,
    {
        let Some(channel) = self.channels.get_mut(&token) else {
            return Ok(());
        };
        let Channel {
            id,
            peer,
            tls,
            cipher_out,
            decoder,
            ..
        } = channel;
        let Some(session) = tls.as_mut() else {
            return Ok(());
        };
        let (id, peer) = (*id, *peer);

        let mut io = ChannelIo {
            cipher_out,
            decoder,
            frames: Vec::new(),
            handshake_complete: false,
            tasks: Vec::new(),
        };
        let outcome = f(session, &mut io);
        let ChannelIo {
            frames,
            handshake_complete,
            tasks,
            ..
        } = io;

        if handshake_complete {
            metrics::record_tls_handshake("completed");
            tracing::debug!(peer = %peer, connection_id = %id, "TLS handshake complete");
        }
        for task in tasks {
            self.submit_task(token, id, task);
        }
        self.deliver(peer, frames);

        match outcome {
            Ok(DriveOutcome::Closed) => Err(Fault::Eof),
            Ok(_) => Ok(()),
            Err(e) => {
                metrics::record_tls_handshake("failed");
                Err(Fault::Tls(e))
            }
        }
    }

    fn submit_task(&self, token: Token, id: ConnectionId, task: DelegatedTask) {
        let tx = self.completions_tx.clone();
        let waker = Arc::clone(&self.waker);
        self.tls_pool.execute(move || {
            let done = task.run();
            if tx.send(TaskCompletion { token, id, done }).is_ok() {
                if let Err(e) = waker.wake() {
                    tracing::debug!(error = %e, "Failed to wake selector after TLS task");
                }
            }
        });
    }

    fn write(&mut self, token: Token) -> Result<(), Fault> {
        match self.channels.get(&token) {
            Some(channel) if channel.connecting => Ok(()),
            Some(channel) if channel.tls.is_some() => self.write_tls(token),
            Some(_) => self.write_clear(token),
            None => Ok(()),
        }
    }

    fn write_clear(&mut self, token: Token) -> Result<(), Fault> {
        let Some(channel) = self.channels.get_mut(&token) else {
            return Ok(());
        };
        let peer = channel.peer;

        let blocked = loop {
            let Some(buf) = self.manager.pop_write(peer) else {
                break false;
            };
            match write_some(&mut channel.stream, &buf) {
                Ok(n) if n == buf.len() => metrics::record_bytes_sent(n),
                Ok(n) => {
                    metrics::record_bytes_sent(n);
                    self.manager.push_front(peer, buf[n..].to_vec());
                    break true;
                }
                Err(e) => {
                    self.manager.push_front(peer, buf);
                    return Err(Fault::Io(e));
                }
            }
        };

        self.set_interest(token, blocked)
    }

    fn write_tls(&mut self, token: Token) -> Result<(), Fault> {
        loop {
            let Some(channel) = self.channels.get_mut(&token) else {
                return Ok(());
            };
            let written = flush(&mut channel.stream, &mut channel.cipher_out)?;
            metrics::record_bytes_sent(written);
            if !channel.cipher_out.is_empty() {
                return self.set_interest(token, true);
            }

            let ready = channel
                .tls
                .as_ref()
                .is_some_and(|s| s.is_handshake_complete() && !s.is_awaiting_task());
            if !ready {
                return self.set_interest(token, false);
            }
            let Some(buf) = self.manager.pop_write(channel.peer) else {
                return self.set_interest(token, false);
            };
            self.drive_tls(token, move |session, io| {
                session.queue_plaintext(&buf);
                session.drive(io)
            })?;
        }
    }

    /// Read interest always; write interest while output is blocked.
    fn set_interest(&mut self, token: Token, write: bool) -> Result<(), Fault> {
        let Some(channel) = self.channels.get_mut(&token) else {
            return Ok(());
        };
        let interest = if write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if channel.interest != interest {
            self.poll.registry().reregister(&mut channel.stream, token, interest)?;
            channel.interest = interest;
        }
        Ok(())
    }

    fn cleanup(&mut self, token: Token, fault: Fault) {
        let Some(mut channel) = self.channels.remove(&token) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut channel.stream) {
            tracing::trace!(error = %e, "Deregister failed");
        }
        self.manager.channel_closed(channel.peer, channel.id);
        if channel.is_counted() {
            metrics::record_connection_closed();
        }

        match &fault {
            Fault::Eof => tracing::debug!(peer = %channel.peer, connection_id = %channel.id, "Connection closed by peer"),
            Fault::Io(e) => tracing::warn!(peer = %channel.peer, connection_id = %channel.id, error = %e, "Connection failed"),
            Fault::Tls(e) => tracing::warn!(peer = %channel.peer, connection_id = %channel.id, error = %e, "TLS failure, closing connection"),
        }

        if fault.retries() && channel.direction == Direction::Outbound && self.manager.has_pending(channel.peer) {
            self.manager.retry_connect(channel.peer);
        }
    }

    fn close_all(&mut self) {
        let count = self.channels.len();
        for (_, mut channel) in self.channels.drain() {
            if let Err(e) = self.poll.registry().deregister(&mut channel.stream) {
                tracing::trace!(error = %e, "Deregister failed");
            }
            if channel.is_counted() {
                metrics::record_connection_closed();
            }
        }
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            tracing::trace!(error = %e, "Deregister listener failed");
        }
        self.manager.clear();
        tracing::info!(channels = count, "Selector loop stopped");
    }
}

/// Write as much of `buf` as the socket takes without blocking.
fn write_some(stream: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Write out the front of `buf` and drop what was written.
fn flush(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let written = write_some(stream, buf)?;
    buf.drain(..written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(direction: Direction, connecting: bool) -> Channel {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = listener.local_addr().unwrap();
        Channel {
            id: ConnectionId::new(),
            stream: TcpStream::connect(peer).unwrap(),
            peer,
            direction,
            connecting,
            interest: Interest::READABLE,
            decoder: FrameCodec::default().decoder(),
            tls: None,
            cipher_out: Vec::new(),
        }
    }

    #[test]
    fn only_established_channels_count_as_active() {
        assert!(channel(Direction::Inbound, false).is_counted());
        assert!(channel(Direction::Outbound, false).is_counted());
        assert!(!channel(Direction::Outbound, true).is_counted());
    }
}
