//! A TLS engine over a rustls connection.
//!
//! The engine exposes the wrap/unwrap contract the session driver expects:
//! `wrap` turns plaintext into records, `unwrap` turns records into
//! plaintext, and every call reports a status plus the bytes consumed and
//! produced. Handshake messages are only buffered by `unwrap`; processing
//! them (certificate verification, key agreement) is deferred to
//! [`TlsEngine::run_delegated`], which the caller runs off the selector
//! thread.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use super::TlsError;

/// What the engine needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// Records are waiting to be produced.
    NeedWrap,
    /// More records from the peer are needed.
    NeedUnwrap,
    /// Buffered handshake data must be processed by a delegated task.
    NeedTask,
    /// The handshake has just completed.
    Finished,
}

/// Outcome of a single wrap or unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// The destination buffer is too small.
    BufferOverflow,
    /// The source does not hold enough data.
    BufferUnderflow,
    /// The peer sent close_notify.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }
}

pub struct TlsEngine {
    conn: Connection,
    task_pending: bool,
    finished_reported: bool,
    peer_closed: bool,
    buffered_plaintext: usize,
}

impl TlsEngine {
    pub fn client(config: Arc<ClientConfig>, name: ServerName<'static>) -> Result<Self, TlsError> {
        Ok(Self::wrap_connection(ClientConnection::new(config, name)?.into()))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        Ok(Self::wrap_connection(ServerConnection::new(config)?.into()))
    }

    fn wrap_connection(conn: Connection) -> Self {
        Self {
            conn,
            task_pending: false,
            finished_reported: false,
            peer_closed: false,
            buffered_plaintext: 0,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.conn, Connection::Client(_))
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        if self.task_pending {
            HandshakeStatus::NeedTask
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// True exactly once, the first time this is called after the handshake
    /// has completed.
    pub fn take_finished(&mut self) -> bool {
        if self.finished_reported || self.task_pending || self.conn.is_handshaking() {
            return false;
        }
        self.finished_reported = true;
        true
    }

    /// Decrypted bytes held inside the engine that have not been unwrapped.
    pub fn has_buffered_plaintext(&self) -> bool {
        self.buffered_plaintext > 0
    }

    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Encrypt as much of `src` as the engine accepts and emit pending
    /// records into `dst`.
    ///
    /// Plaintext is only accepted once the handshake is over; until then
    /// this flushes handshake records.
    pub fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() && !self.conn.is_handshaking() {
            consumed = self.conn.writer().write(src)?;
        }

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut window = &mut dst[produced..];
            let n = self.conn.write_tls(&mut window)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        if produced == 0 && self.conn.wants_write() {
            return Ok(EngineResult::new(EngineStatus::BufferOverflow, consumed, 0));
        }
        Ok(EngineResult::new(EngineStatus::Ok, consumed, produced))
    }

    /// Feed records from `src` and decrypt application data into `dst`.
    ///
    /// While decrypted bytes from earlier records are still held, no new
    /// records are read; rustls refuses input once its plaintext buffer is
    /// full.
    pub fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() && self.buffered_plaintext == 0 {
            // read_tls treats an empty reader as EOF.
            let mut reader = src;
            consumed = self.conn.read_tls(&mut reader)?;
        }

        if self.conn.is_handshaking() {
            if consumed == 0 {
                return Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0));
            }
            self.task_pending = true;
            return Ok(EngineResult::new(EngineStatus::Ok, consumed, 0));
        }

        let state = self.conn.process_new_packets()?;
        self.peer_closed |= state.peer_has_closed();
        let pending = state.plaintext_bytes_to_read();
        if pending > dst.len() {
            self.buffered_plaintext = pending;
            return Ok(EngineResult::new(EngineStatus::BufferOverflow, consumed, 0));
        }

        let produced = self.read_plaintext(dst)?;
        self.buffered_plaintext = pending.saturating_sub(produced);

        let status = if produced == 0 && self.peer_closed {
            EngineStatus::Closed
        } else if produced == 0 && consumed == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let mut produced = 0;
        while produced < dst.len() {
            match self.conn.reader().read(&mut dst[produced..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => produced += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.peer_closed = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(produced)
    }

    /// Process buffered handshake data. This is the expensive part of the
    /// handshake and runs on the TLS task pool.
    pub fn run_delegated(&mut self) -> Result<(), TlsError> {
        self.task_pending = false;
        let state = self.conn.process_new_packets()?;
        self.peer_closed |= state.peer_has_closed();
        self.buffered_plaintext = state.plaintext_bytes_to_read();
        Ok(())
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("client", &self.is_client())
            .field("status", &self.handshake_status())
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}
