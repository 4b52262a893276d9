//! Local port-forwarding session manager
//!
//! Accepts local TCP connections and relays them to a remote endpoint, keeping
//! track of many concurrent forwarding sessions by id.
//!
//! ```ignore
//! use localfwd_proxy::{ProxyManager, ProxyTarget};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProxyManager::new();
//!
//! // Port 0 lets the OS pick a free local port
//! let proxy = manager
//!     .start_proxy(ProxyTarget::new("demo", "postgres"), 0, "10.0.0.5", 5432)
//!     .await?;
//! println!("psql -h 127.0.0.1 -p {}", proxy.local_port);
//!
//! let status = manager.get_proxy_status(&proxy.proxy_id).await?;
//! println!("{} bytes in, {} bytes out", status.bytes_in, status.bytes_out);
//!
//! manager.stop_proxy(&proxy.proxy_id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Components
//!
//! - **ProxyManager**: registry of sessions; start, list, status, stop
//! - **ProxySession**: one listener plus its accept loop and counters
//! - **TcpForwarder**: dials the remote and relays one connection
//! - **find_available_port / validate_port**: local port helpers

pub mod config;
pub mod error;
pub mod forwarder;
pub mod manager;
pub mod port;
pub mod session;
pub mod status;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use forwarder::{ForwardOutcome, TcpForwarder, TrafficStats};
pub use manager::ProxyManager;
pub use port::{find_available_port, find_available_port_on, validate_port};
pub use session::ProxySession;
pub use status::{
    ProxyListResponse, ProxyResponse, ProxyState, ProxyStatus, ProxyTarget, StopAllResponse,
};
