//! Error types for the proxy session manager

use thiserror::Error;

/// Errors surfaced by the proxy manager and its sessions
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind to {address}:{port}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Omit the local port to let the OS pick a free one")]
    Bind {
        address: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid remote endpoint: {0}")]
    InvalidRemote(String),

    #[error("Proxy not found: {0}")]
    NotFound(String),

    #[error("Failed to connect to remote address {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },

    #[error("Listener failed to accept connection: {0}")]
    Accept(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
