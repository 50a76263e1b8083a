//! TLS configuration, certificate loading and per-channel sessions.
//!
//! # Data Flow
//! ```text
//! TlsConfig (mode, PEM paths)
//!     → TlsContext::from_config (rustls-pemfile → rustls Server/ClientConfig)
//!     → server_session() on accept / client_session(peer) on connect
//!     → session.rs driver (wrap/unwrap against the channel's buffers)
//!     → engine.rs (rustls connection; handshake processing as a delegated task)
//! ```
//!
//! # Design Decisions
//! - TLS is terminated entirely in user space; the socket stays non-blocking
//! - A TLS failure tears down that one channel, never the selector
//! - The crypto provider is pinned to ring regardless of rustls feature unification

pub mod engine;
pub mod session;

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::{TlsConfig, TlsMode};

pub use engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
pub use session::{CompletedTask, DelegatedTask, DriveOutcome, TlsIo, TlsSession};

/// Errors from TLS setup and from the per-channel state machine.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    #[error("failed to read {path}: {source}")]
    Pem { path: String, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS mode requires {0}")]
    MissingMaterial(&'static str),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("invalid server name '{0}'")]
    ServerName(String),

    #[error("TLS buffer would exceed {max} bytes")]
    BufferLimit { max: usize },

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Shared TLS state for every channel of a node.
#[derive(Clone)]
pub struct TlsContext {
    mode: TlsMode,
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    server_name: Option<String>,
    initial_buffer_size: usize,
    max_buffer_size: usize,
}

impl TlsContext {
    /// Build the context for `config`; `None` in clear mode.
    pub fn from_config(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if config.mode == TlsMode::Clear {
            return Ok(None);
        }

        let cert_path = config.cert_path.as_deref().ok_or(TlsError::MissingMaterial("cert_path"))?;
        let key_path = config.key_path.as_deref().ok_or(TlsError::MissingMaterial("key_path"))?;
        let ca_path = config.ca_path.as_deref().ok_or(TlsError::MissingMaterial("ca_path"))?;

        let certs = load_certs(Path::new(cert_path))?;
        let key = load_private_key(Path::new(key_path))?;
        let roots = Arc::new(load_roots(Path::new(ca_path))?);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server = build_server_config(config.mode, &provider, &roots, certs.clone(), key.clone_key())?;
        let client = build_client_config(config.mode, &provider, &roots, certs, key)?;

        tracing::info!(mode = ?config.mode, cert = cert_path, ca = ca_path, "TLS context loaded");

        Ok(Some(Self {
            mode: config.mode,
            server: Arc::new(server),
            client: Arc::new(client),
            server_name: config.server_name.clone(),
            initial_buffer_size: config.initial_buffer_size,
            max_buffer_size: config.max_buffer_size,
        }))
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    /// Session for an accepted channel.
    pub fn server_session(&self) -> Result<TlsSession, TlsError> {
        let engine = TlsEngine::server(Arc::clone(&self.server))?;
        Ok(TlsSession::new(engine, self.initial_buffer_size, self.max_buffer_size))
    }

    /// Session for an outbound channel to `peer`.
    pub fn client_session(&self, peer: SocketAddr) -> Result<TlsSession, TlsError> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| peer.ip().to_string());
        let server_name = ServerName::try_from(name.clone()).map_err(|_| TlsError::ServerName(name))?;
        let engine = TlsEngine::client(Arc::clone(&self.client), server_name)?;
        Ok(TlsSession::new(engine, self.initial_buffer_size, self.max_buffer_size))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("mode", &self.mode)
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn build_server_config(
    mode: TlsMode,
    provider: &Arc<CryptoProvider>,
    roots: &Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    let builder = ServerConfig::builder_with_provider(Arc::clone(provider)).with_safe_default_protocol_versions()?;
    let config = match mode {
        TlsMode::MutualAuth => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(provider)).build()?;
            builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
        }
        _ => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(config)
}

fn build_client_config(
    mode: TlsMode,
    provider: &Arc<CryptoProvider>,
    roots: &Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig, TlsError> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(Arc::clone(roots));
    let config = match mode {
        TlsMode::MutualAuth => builder.with_client_auth_cert(certs, key)?,
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Pem {
        path: path.display().to_string(),
        source,
    })
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Load a PEM CA bundle into a root store.
pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    pub fn tls_config(mode: TlsMode, identity: &str) -> TlsConfig {
        TlsConfig {
            mode,
            cert_path: Some(fixture(&format!("{identity}.pem"))),
            key_path: Some(fixture(&format!("{identity}.key"))),
            ca_path: Some(fixture("ca.pem")),
            ..TlsConfig::default()
        }
    }

    pub fn context(mode: TlsMode, identity: &str) -> TlsContext {
        TlsContext::from_config(&tls_config(mode, identity)).unwrap().unwrap()
    }
}
