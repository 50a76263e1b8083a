//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → threaded through Transport / Dispatcher / Messenger constructors
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new node map swapped into the resolver
//! ```
//!
//! # Design Decisions
//! - No process-wide statics: pool sizes and backoff constants live here
//! - All fields have defaults to allow minimal configs
//! - Only the node map is hot-reloadable; socket and TLS settings need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ConnectionConfig, DispatchConfig, FramingConfig, ListenerConfig, LogFormat, NodeConfig,
    ObservabilityConfig, RetransmitConfig, TlsConfig, TlsMode, TransportConfig,
};
pub use validation::{validate_config, ValidationError};
