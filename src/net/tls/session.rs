//! Per-channel TLS state and the wrap/unwrap driver.
//!
//! # Responsibilities
//! - Hold the four buffers of a TLS channel (outbound plaintext and
//!   ciphertext, inbound ciphertext and plaintext)
//! - Drive the engine until it can make no further progress
//! - Lend the engine to a delegated task and take it back on completion
//!
//! # Data Flow
//! ```text
//! outbound: queue_plaintext → out_plain → wrap → out_cipher → TlsIo::on_outbound
//! inbound:  queue_ciphertext → in_cipher → unwrap → in_plain → TlsIo::on_inbound
//! ```
//!
//! # Design Decisions
//! - Buffers start at the configured record size and double on overflow up
//!   to a hard maximum; exceeding it is a channel error
//! - While a task holds the engine the session is inert; `drive` returns
//!   `AwaitingTask` until `complete_task` hands the engine back

use super::engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
use super::TlsError;

/// Callbacks from the driver into the owning channel.
pub trait TlsIo {
    /// Records ready for the socket.
    fn on_outbound(&mut self, ciphertext: &[u8]);
    /// Decrypted application bytes.
    fn on_inbound(&mut self, plaintext: &[u8]);
    /// The handshake has completed; called once per session.
    fn on_handshake_complete(&mut self);
    /// The engine needs `task` run off the selector thread.
    fn submit_task(&mut self, task: DelegatedTask);
}

/// Handshake work lent out of a session.
#[derive(Debug)]
pub struct DelegatedTask {
    engine: TlsEngine,
}

impl DelegatedTask {
    pub fn run(mut self) -> CompletedTask {
        let result = self.engine.run_delegated();
        CompletedTask {
            engine: self.engine,
            result,
        }
    }
}

#[derive(Debug)]
pub struct CompletedTask {
    engine: TlsEngine,
    result: Result<(), TlsError>,
}

/// Where the driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Waiting for socket I/O.
    Idle,
    /// The engine is out on a delegated task.
    AwaitingTask,
    /// The peer closed the TLS session.
    Closed,
}

enum Step {
    Continue,
    Pause,
    Closed,
}

#[derive(Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug)]
pub struct TlsSession {
    engine: Option<TlsEngine>,
    client: bool,
    out_plain: Vec<u8>,
    out_cipher: Vec<u8>,
    in_cipher: Vec<u8>,
    in_plain: Vec<u8>,
    status: HandshakeStatus,
    handshake_complete: bool,
    max_buffer_size: usize,
}

impl TlsSession {
    pub fn new(engine: TlsEngine, initial_buffer_size: usize, max_buffer_size: usize) -> Self {
        let client = engine.is_client();
        Self {
            engine: Some(engine),
            client,
            out_plain: Vec::new(),
            out_cipher: vec![0; initial_buffer_size],
            in_cipher: Vec::new(),
            in_plain: vec![0; initial_buffer_size],
            status: HandshakeStatus::NeedUnwrap,
            handshake_complete: false,
            max_buffer_size,
        }
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn status(&self) -> HandshakeStatus {
        self.status
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_awaiting_task(&self) -> bool {
        self.engine.is_none()
    }

    /// Plaintext accepted for sending but not yet encrypted.
    pub fn pending_plaintext(&self) -> usize {
        self.out_plain.len()
    }

    pub fn queue_plaintext(&mut self, plaintext: &[u8]) {
        self.out_plain.extend_from_slice(plaintext);
    }

    pub fn queue_ciphertext(&mut self, ciphertext: &[u8]) {
        self.in_cipher.extend_from_slice(ciphertext);
    }

    /// Run the engine until it stalls on I/O, a delegated task or close.
    pub fn drive(&mut self, io: &mut dyn TlsIo) -> Result<DriveOutcome, TlsError> {
        loop {
            let step = self.step(io)?;
            self.check_finished(io);
            match step {
                Step::Continue => continue,
                Step::Closed => return Ok(DriveOutcome::Closed),
                Step::Pause if self.engine.is_none() => return Ok(DriveOutcome::AwaitingTask),
                Step::Pause => return Ok(DriveOutcome::Idle),
            }
        }
    }

    /// Take back the engine from a finished task and continue driving.
    pub fn complete_task(&mut self, done: CompletedTask, io: &mut dyn TlsIo) -> Result<DriveOutcome, TlsError> {
        self.engine = Some(done.engine);
        done.result?;
        self.drive(io)
    }

    #[cfg(test)]
    pub(crate) fn into_engine(self) -> Option<TlsEngine> {
        self.engine
    }

    fn step(&mut self, io: &mut dyn TlsIo) -> Result<Step, TlsError> {
        let (status, buffered) = match &self.engine {
            Some(engine) => (engine.handshake_status(), engine.has_buffered_plaintext()),
            None => return Ok(Step::Pause),
        };
        self.status = status;

        match status {
            HandshakeStatus::NeedTask => {
                if let Some(engine) = self.engine.take() {
                    io.submit_task(DelegatedTask { engine });
                }
                Ok(Step::Pause)
            }
            HandshakeStatus::NeedWrap => self.wrap(io),
            HandshakeStatus::NeedUnwrap if self.in_cipher.is_empty() => Ok(Step::Pause),
            HandshakeStatus::NeedUnwrap => self.unwrap(io),
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                let mut progressed = false;
                if !self.out_plain.is_empty() {
                    match self.wrap(io)? {
                        Step::Closed => return Ok(Step::Closed),
                        Step::Continue => progressed = true,
                        Step::Pause => {}
                    }
                }
                if !self.in_cipher.is_empty() || buffered {
                    match self.unwrap(io)? {
                        Step::Closed => return Ok(Step::Closed),
                        Step::Continue => progressed = true,
                        Step::Pause => {}
                    }
                }
                Ok(if progressed { Step::Continue } else { Step::Pause })
            }
        }
    }

    fn wrap(&mut self, io: &mut dyn TlsIo) -> Result<Step, TlsError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(Step::Pause);
        };
        let result = engine.wrap(&self.out_plain, &mut self.out_cipher)?;
        self.out_plain.drain(..result.consumed);
        if result.produced > 0 {
            io.on_outbound(&self.out_cipher[..result.produced]);
        }
        self.settle(result, Direction::Outbound)
    }

    fn unwrap(&mut self, io: &mut dyn TlsIo) -> Result<Step, TlsError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(Step::Pause);
        };
        let result = engine.unwrap(&self.in_cipher, &mut self.in_plain)?;
        self.in_cipher.drain(..result.consumed);
        if result.produced > 0 {
            io.on_inbound(&self.in_plain[..result.produced]);
        }
        self.settle(result, Direction::Inbound)
    }

    fn settle(&mut self, result: EngineResult, direction: Direction) -> Result<Step, TlsError> {
        match result.status {
            EngineStatus::Ok if result.consumed > 0 || result.produced > 0 => Ok(Step::Continue),
            EngineStatus::Ok | EngineStatus::BufferUnderflow => Ok(Step::Pause),
            EngineStatus::BufferOverflow => {
                self.grow(direction)?;
                Ok(Step::Continue)
            }
            EngineStatus::Closed => Ok(Step::Closed),
        }
    }

    fn grow(&mut self, direction: Direction) -> Result<(), TlsError> {
        let max = self.max_buffer_size;
        let buffer = match direction {
            Direction::Outbound => &mut self.out_cipher,
            Direction::Inbound => &mut self.in_plain,
        };
        if buffer.len() >= max {
            return Err(TlsError::BufferLimit { max });
        }
        let size = (buffer.len().max(1) * 2).min(max);
        tracing::debug!(from = buffer.len(), to = size, "Growing TLS buffer");
        buffer.resize(size, 0);
        Ok(())
    }

    fn check_finished(&mut self, io: &mut dyn TlsIo) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.take_finished() {
            self.handshake_complete = true;
            self.status = HandshakeStatus::Finished;
            io.on_handshake_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, tls_config};
    use super::super::TlsContext;
    use super::*;
    use crate::config::TlsMode;

    #[derive(Default)]
    struct Pipe {
        outbound: Vec<u8>,
        inbound: Vec<u8>,
        completions: usize,
        tasks: Vec<DelegatedTask>,
    }

    impl TlsIo for Pipe {
        fn on_outbound(&mut self, ciphertext: &[u8]) {
            self.outbound.extend_from_slice(ciphertext);
        }

        fn on_inbound(&mut self, plaintext: &[u8]) {
            self.inbound.extend_from_slice(plaintext);
        }

        fn on_handshake_complete(&mut self) {
            self.completions += 1;
        }

        fn submit_task(&mut self, task: DelegatedTask) {
            self.tasks.push(task);
        }
    }

    struct End {
        session: TlsSession,
        io: Pipe,
    }

    impl End {
        fn new(session: TlsSession) -> Self {
            Self {
                session,
                io: Pipe::default(),
            }
        }

        fn drive(&mut self) -> Result<(), TlsError> {
            self.session.drive(&mut self.io)?;
            while let Some(task) = self.io.tasks.pop() {
                self.session.complete_task(task.run(), &mut self.io)?;
            }
            Ok(())
        }
    }

    fn pump(client: &mut End, server: &mut End) -> Result<(), TlsError> {
        for _ in 0..32 {
            client.drive()?;
            let to_server = std::mem::take(&mut client.io.outbound);
            server.session.queue_ciphertext(&to_server);
            server.drive()?;
            let to_client = std::mem::take(&mut server.io.outbound);
            client.session.queue_ciphertext(&to_client);
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn pair(server_ctx: &TlsContext, client_ctx: &TlsContext, buffer: usize, max: usize) -> (End, End) {
        let mut client = client_ctx.client_session("127.0.0.1:1".parse().unwrap()).unwrap();
        let mut server = server_ctx.server_session().unwrap();
        client.max_buffer_size = max;
        server.max_buffer_size = max;
        client.in_plain.truncate(buffer);
        server.in_plain.truncate(buffer);
        (End::new(client), End::new(server))
    }

    #[test]
    fn handshake_completes_once_per_side() {
        let ctx = context(TlsMode::ServerAuth, "server");
        let (mut client, mut server) = pair(&ctx, &ctx, 16_709, 1 << 20);

        pump(&mut client, &mut server).unwrap();

        assert!(client.session.is_handshake_complete());
        assert!(server.session.is_handshake_complete());
        assert_eq!(client.io.completions, 1);
        assert_eq!(server.io.completions, 1);
    }

    #[test]
    fn application_data_flows_both_ways() {
        let ctx = context(TlsMode::MutualAuth, "server");
        let client_ctx = context(TlsMode::MutualAuth, "client");
        let (mut client, mut server) = pair(&ctx, &client_ctx, 16_709, 1 << 20);

        client.session.queue_plaintext(b"3&{\"type\":1}&");
        pump(&mut client, &mut server).unwrap();
        assert_eq!(server.io.inbound, b"3&{\"type\":1}&");

        server.session.queue_plaintext(b"pong");
        pump(&mut client, &mut server).unwrap();
        assert_eq!(client.io.inbound, b"pong");
        assert_eq!(client.session.pending_plaintext(), 0);
    }

    #[test]
    fn inbound_buffer_grows_for_large_records() {
        let ctx = context(TlsMode::ServerAuth, "server");
        let (mut client, mut server) = pair(&ctx, &ctx, 64, 1 << 20);
        let payload: Vec<u8> = (0..12_000u32).map(|i| (i % 251) as u8).collect();

        client.session.queue_plaintext(&payload);
        pump(&mut client, &mut server).unwrap();

        assert_eq!(server.io.inbound, payload);
        assert!(server.session.in_plain.len() > 64);
    }

    #[test]
    fn full_record_followed_by_more_records_in_one_read() {
        let ctx = context(TlsMode::ServerAuth, "server");
        let (mut client, mut server) = pair(&ctx, &ctx, 16_709, 1 << 20);
        pump(&mut client, &mut server).unwrap();

        let mut expected = Vec::new();
        for (len, fill) in [(16_384, 1u8), (2_000, 2), (5_000, 3), (5_000, 4)] {
            let message = vec![fill; len];
            expected.extend_from_slice(&message);
            client.session.queue_plaintext(&message);
            client.drive().unwrap();
        }

        // Every record lands in the server's inbound buffer at once.
        let wire = std::mem::take(&mut client.io.outbound);
        server.session.queue_ciphertext(&wire);
        server.drive().unwrap();

        assert_eq!(server.io.inbound.len(), expected.len());
        assert_eq!(server.io.inbound, expected);
        assert!(server.session.in_cipher.is_empty());
    }

    #[test]
    fn exceeding_max_buffer_is_an_error() {
        let ctx = context(TlsMode::ServerAuth, "server");
        let (mut client, mut server) = pair(&ctx, &ctx, 64, 128);
        pump(&mut client, &mut server).unwrap();

        client.session.queue_plaintext(&vec![7u8; 4096]);
        let result = pump(&mut client, &mut server);
        assert!(matches!(result, Err(TlsError::BufferLimit { max: 128 })));
    }

    #[test]
    fn untrusted_client_certificate_fails_handshake() {
        let server_ctx = context(TlsMode::MutualAuth, "server");
        let rogue = tls_config(TlsMode::MutualAuth, "rogue");
        let client_ctx = TlsContext::from_config(&rogue).unwrap().unwrap();
        let (mut client, mut server) = pair(&server_ctx, &client_ctx, 16_709, 1 << 20);

        assert!(pump(&mut client, &mut server).is_err());
        assert!(!server.session.is_handshake_complete());
    }

    #[test]
    fn task_lends_engine_out() {
        let ctx = context(TlsMode::ServerAuth, "server");
        let mut client = End::new(ctx.client_session("127.0.0.1:1".parse().unwrap()).unwrap());
        let mut server = ctx.server_session().unwrap();
        let mut io = Pipe::default();

        client.drive().unwrap();
        server.queue_ciphertext(&client.io.outbound);
        assert_eq!(server.drive(&mut io).unwrap(), DriveOutcome::AwaitingTask);
        assert!(server.is_awaiting_task());
        assert_eq!(server.drive(&mut io).unwrap(), DriveOutcome::AwaitingTask);

        let task = io.tasks.pop().unwrap();
        assert_eq!(server.complete_task(task.run(), &mut io).unwrap(), DriveOutcome::Idle);
        assert!(!io.outbound.is_empty());
    }
}
