//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging/metrics → Messenger::start
//!     (dispatcher → transport listener → selector thread)
//!
//! Shutdown (shutdown.rs):
//!     stop() → flag + wake selector → selector drops channels & listener
//!            → retransmission tasks observe broadcast → pools shut down
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Messenger::stop()
//! ```
//!
//! # Design Decisions
//! - stop() is the only cancellation primitive; there are no per-message deadlines
//! - stop() is idempotent

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
