//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Send to a peer with no channel:
//!     → throttle.rs (at most one connect per address per interval)
//!
//! Send accepted only partially (congestion):
//!     → backoff.rs (retransmission delay = base * factor^(n-1))
//! ```
//!
//! # Design Decisions
//! - Throttling prevents connection storms against a dead peer
//! - Retransmission never gives up on congestion, only on unreachability
//! - Jitter is opt-in; the default schedule is exact

pub mod backoff;
pub mod throttle;

pub use backoff::{calculate_backoff, RetransmitPolicy};
pub use throttle::ReconnectThrottle;
