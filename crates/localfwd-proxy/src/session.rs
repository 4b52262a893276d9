//! A single forwarding session
//!
//! Owns one local listener (moved into its accept loop), a cancellation token
//! and the traffic counters. The state machine is `active -> stopped` on an
//! explicit stop or `active -> error` when the listener fails; both ends are
//! terminal.

use crate::error::ProxyError;
use crate::forwarder::{ForwardOutcome, TcpForwarder, TrafficStats};
use crate::status::{ProxyResponse, ProxyState, ProxyStatus, ProxyTarget};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct SessionState {
    status: ProxyState,
    last_error: Option<String>,
}

/// One local-port-to-remote-endpoint forwarding instance
#[derive(Debug)]
pub struct ProxySession {
    id: String,
    target: ProxyTarget,
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

impl ProxySession {
    pub(crate) fn new(
        id: String,
        target: ProxyTarget,
        local_addr: SocketAddr,
        remote_host: String,
        remote_port: u16,
    ) -> Self {
        Self {
            id,
            target,
            local_addr,
            remote_host,
            remote_port,
            started_at: Utc::now(),
            state: Mutex::new(SessionState {
                status: ProxyState::Active,
                last_error: None,
            }),
            stats: Arc::new(TrafficStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_address(&self) -> String {
        if self.remote_host.contains(':') && !self.remote_host.starts_with('[') {
            format!("[{}]:{}", self.remote_host, self.remote_port)
        } else {
            format!("{}:{}", self.remote_host, self.remote_port)
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn state(&self) -> ProxyState {
        self.lock_state().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Leave `active`. Returns false if the session already left it.
    fn transition(&self, to: ProxyState, error: Option<String>) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return false;
        }
        state.status = to;
        state.last_error = error;
        true
    }

    /// Mark the session stopped and wake its accept loop.
    ///
    /// A session that already failed keeps its `error` state.
    pub(crate) fn stop(&self) -> bool {
        let changed = self.transition(ProxyState::Stopped, None);
        self.cancel.cancel();
        changed
    }

    pub fn response(&self) -> ProxyResponse {
        self.project(self.state())
    }

    /// Snapshot with counters. State and error come from one lock so they
    /// always agree.
    pub fn status(&self) -> ProxyStatus {
        let (state, error) = {
            let state = self.lock_state();
            (state.status, state.last_error.clone())
        };
        ProxyStatus {
            proxy: self.project(state),
            bytes_in: self.stats.bytes_in(),
            bytes_out: self.stats.bytes_out(),
            connections_in: self.stats.connections(),
            error,
        }
    }

    fn project(&self, status: ProxyState) -> ProxyResponse {
        ProxyResponse {
            proxy_id: self.id.clone(),
            target: self.target.clone(),
            local_port: self.local_port(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            status,
            started_at: self.started_at.to_rfc3339(),
        }
    }

    /// Start the accept loop. The listener lives exactly as long as the
    /// returned task.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        listener: TcpListener,
        forwarder: TcpForwarder,
        close_connections_on_stop: bool,
    ) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(session.accept_loop(listener, forwarder, close_connections_on_stop))
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        forwarder: TcpForwarder,
        close_connections_on_stop: bool,
    ) {
        info!(
            proxy_id = %self.id,
            local = %self.local_addr,
            remote = %forwarder.remote_address(),
            "Proxy listening"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(proxy_id = %self.id, "Accept loop cancelled");
                    break;
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(proxy_id = %self.id, peer = %peer_addr, "Accepted local connection");

                    let guard = self.stats.open_connection();
                    let stats = self.stats.clone();
                    let forwarder = forwarder.clone();
                    let cancel = close_connections_on_stop.then(|| self.cancel.child_token());
                    let proxy_id = self.id.clone();

                    tokio::spawn(async move {
                        let _guard = guard;
                        match forwarder.forward(stream, peer_addr, &stats, cancel).await {
                            Ok(ForwardOutcome::Closed) => {
                                debug!(proxy_id = %proxy_id, peer = %peer_addr, "Connection closed");
                            }
                            Ok(ForwardOutcome::Cancelled) => {
                                debug!(proxy_id = %proxy_id, peer = %peer_addr, "Connection closed by stop");
                            }
                            Err(e) => {
                                warn!(proxy_id = %proxy_id, peer = %peer_addr, "Dropping connection: {}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let err = ProxyError::Accept(e.to_string());
                    error!(proxy_id = %self.id, "{}", err);
                    self.transition(ProxyState::Error, Some(err.to_string()));
                    break;
                }
            }
        }

        drop(listener);
        debug!(proxy_id = %self.id, local = %self.local_addr, "Listener released");
    }
}
