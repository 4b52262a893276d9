//! Local port helpers
//!
//! Ephemeral port discovery and validation of user supplied port strings.

use crate::error::{ProxyError, Result};
use tokio::net::TcpListener;

/// Ask the OS for a free ephemeral port on the loopback interface.
///
/// The socket is released before returning, so another process may grab the
/// port before the caller binds it. Callers are expected to retry on bind
/// failure.
pub async fn find_available_port() -> Result<u16> {
    find_available_port_on("127.0.0.1").await
}

/// Like [`find_available_port`], probing the interface the port will
/// actually be bound on.
pub async fn find_available_port_on(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Parse a local port as typed by a user.
///
/// An empty string means "auto-assign" and yields `0`.
pub fn validate_port(input: &str) -> Result<u16> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }

    let port: i64 = input
        .parse()
        .map_err(|_| ProxyError::InvalidPort(format!("'{}' is not a number", input)))?;

    if !(1..=65535).contains(&port) {
        return Err(ProxyError::InvalidPort(format!(
            "{} is outside the range 1-65535",
            port
        )));
    }

    Ok(port as u16)
}
