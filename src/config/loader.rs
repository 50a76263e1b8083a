//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::TransportConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<TransportConfig, ConfigError> {
    let config: TransportConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<TransportConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_invalid_values() {
        let err = parse_config("[framing]\ndelimiter = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn parse_rejects_bad_toml() {
        let err = parse_config("[node\nid = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("ns-transport-loader-{}.toml", std::process::id()));
        fs::write(&path, "[node]\nid = \"ns-7\"\n[nodes]\nns-7 = \"127.0.0.1:24407\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.node.id, "ns-7");
        assert_eq!(config.node_address("ns-7"), Some("127.0.0.1:24407".parse().unwrap()));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/ns-transport.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
