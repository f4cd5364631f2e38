//! Error types for the device mock.

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;

/// Startup and supervisor errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind HTTP listener on 127.0.0.1:8080: in use"
        );
    }

    #[test]
    fn test_from_config_error() {
        let err: ServerError = ConfigError::InvalidAddress("bogus:1".to_string()).into();
        assert!(err.to_string().contains("Invalid listen address: bogus:1"));
    }
}
