//! Session registry
//!
//! Creates, lists and tears down proxy sessions. The map is guarded by an
//! async read/write lock; each session guards its own mutable state, so
//! traffic on one session never contends with registry updates.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forwarder::TcpForwarder;
use crate::port::find_available_port_on;
use crate::session::ProxySession;
use crate::status::{ProxyListResponse, ProxyResponse, ProxyStatus, ProxyTarget, StopAllResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry entry for a running session
struct SessionEntry {
    session: Arc<ProxySession>,
    accept_task: JoinHandle<()>,
    /// Insertion order, used to list sessions deterministically
    seq: u64,
}

/// Owns every active forwarding session
pub struct ProxyManager {
    config: ProxyConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_seq: AtomicU64,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::with_config(ProxyConfig::default())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start forwarding `local_port` to `remote_host:remote_port`.
    ///
    /// A `local_port` of 0 picks a free ephemeral port. Returns as soon as
    /// the listener is bound; connections are served in the background.
    pub async fn start_proxy(
        &self,
        target: ProxyTarget,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ProxyResponse> {
        let remote_host = remote_host.trim();
        if remote_host.is_empty() {
            return Err(ProxyError::InvalidRemote(
                "remote host must not be empty".to_string(),
            ));
        }
        if remote_port == 0 {
            return Err(ProxyError::InvalidPort(
                "remote port must be between 1 and 65535".to_string(),
            ));
        }

        let listener = self.bind_listener(local_port).await?;
        let local_addr = listener.local_addr()?;

        let mut sessions = self.sessions.write().await;

        let mut id = Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let session = Arc::new(ProxySession::new(
            id.clone(),
            target,
            local_addr,
            remote_host.to_string(),
            remote_port,
        ));
        let remote = session.remote_address();
        let forwarder = TcpForwarder::new(
            remote.clone(),
            self.config.dial_timeout(),
            self.config.buffer_size,
        );
        let response = session.response();

        let accept_task = session.spawn(
            listener,
            forwarder,
            self.config.close_connections_on_stop,
        );
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            id.clone(),
            SessionEntry {
                session,
                accept_task,
                seq,
            },
        );

        info!(
            proxy_id = %id,
            local_port = local_addr.port(),
            remote = %remote,
            "Proxy started"
        );

        Ok(response)
    }

    /// Stop a session and release its local port.
    pub async fn stop_proxy(&self, id: &str) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))?;

        self.teardown(entry).await;
        Ok(())
    }

    /// Stop every session. Teardowns run concurrently.
    pub async fn stop_all_proxies(&self) -> Result<StopAllResponse> {
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };

        let stopped = entries.len();
        futures::future::join_all(entries.into_iter().map(|entry| self.teardown(entry))).await;

        if stopped > 0 {
            info!("Stopped {} proxy session(s)", stopped);
        }

        Ok(StopAllResponse { stopped })
    }

    /// Snapshot of every registered session in the order they were started
    pub async fn list_proxies(&self) -> ProxyListResponse {
        let sessions = self.sessions.read().await;
        let mut snapshot: Vec<(u64, ProxyStatus)> = sessions
            .values()
            .map(|entry| (entry.seq, entry.session.status()))
            .collect();
        drop(sessions);

        snapshot.sort_by_key(|(seq, _)| *seq);
        ProxyListResponse {
            proxies: snapshot.into_iter().map(|(_, status)| status).collect(),
        }
    }

    pub async fn get_proxy_status(&self, id: &str) -> Result<ProxyStatus> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.session.status())
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn bind_listener(&self, local_port: u16) -> Result<TcpListener> {
        if local_port != 0 {
            return self.bind(local_port).await;
        }

        // The chosen port can be taken before we bind it, so try a
        // few fresh ones before giving up.
        let attempts = self.config.ephemeral_bind_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let port = find_available_port_on(&self.config.bind_host).await?;
            match self.bind(port).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!(
                        "Ephemeral port {} was taken before bind (attempt {}/{})",
                        port, attempt, attempts
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::Bind {
            address: self.config.bind_host.clone(),
            port: 0,
            source: std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "no ephemeral port could be bound",
            ),
        }))
    }

    async fn bind(&self, port: u16) -> Result<TcpListener> {
        TcpListener::bind((self.config.bind_host.as_str(), port))
            .await
            .map_err(|source| ProxyError::Bind {
                address: self.config.bind_host.clone(),
                port,
                source,
            })
    }

    /// Cancel a removed session and wait for its listener to be released
    async fn teardown(&self, entry: SessionEntry) {
        let SessionEntry {
            session,
            mut accept_task,
            ..
        } = entry;

        session.stop();

        match tokio::time::timeout(self.config.stop_timeout(), &mut accept_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(proxy_id = %session.id(), "Accept loop ended abnormally: {}", e);
            }
            Err(_) => {
                warn!(
                    proxy_id = %session.id(),
                    "Accept loop did not exit within {:?}, aborting",
                    self.config.stop_timeout()
                );
                accept_task.abort();
                let _ = accept_task.await;
            }
        }

        info!(
            proxy_id = %session.id(),
            local_port = session.local_port(),
            bytes_in = session.stats().bytes_in(),
            bytes_out = session.stats().bytes_out(),
            "Proxy stopped"
        );
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        for (_, entry) in self.sessions.get_mut().drain() {
            entry.session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ProxyState;

    fn target() -> ProxyTarget {
        ProxyTarget::new("demo", "db")
    }

    #[tokio::test]
    async fn test_start_with_auto_port() {
        let manager = ProxyManager::new();
        let response = manager
            .start_proxy(target(), 0, "127.0.0.1", 5432)
            .await
            .unwrap();

        assert_ne!(response.local_port, 0);
        assert_eq!(response.status, ProxyState::Active);
        assert_eq!(response.remote_host, "127.0.0.1");
        assert_eq!(response.remote_port, 5432);
        assert_eq!(response.target, target());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_remote() {
        let manager = ProxyManager::new();

        let err = manager.start_proxy(target(), 0, "  ", 80).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRemote(_)));

        let err = manager
            .start_proxy(target(), 0, "127.0.0.1", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidPort(_)));

        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_on_taken_port_fails() {
        let manager = ProxyManager::new();
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = manager
            .start_proxy(target(), port, "127.0.0.1", 80)
            .await
            .unwrap_err();
        match err {
            ProxyError::Bind { port: p, .. } => assert_eq!(p, port),
            other => panic!("expected bind error, got {:?}", other),
        }
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_auto_port_uses_the_bind_host() {
        let manager = ProxyManager::with_config(ProxyConfig {
            bind_host: "::1".to_string(),
            ..Default::default()
        });

        // Hosts without IPv6 loopback can't run this
        if TcpListener::bind("[::1]:0").await.is_err() {
            return;
        }

        let response = manager
            .start_proxy(target(), 0, "127.0.0.1", 80)
            .await
            .unwrap();
        assert_ne!(response.local_port, 0);
        assert!(
            tokio::net::TcpStream::connect(("::1", response.local_port))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let manager = ProxyManager::new();
        manager
            .start_proxy(target(), 0, "127.0.0.1", 80)
            .await
            .unwrap();

        let err = manager.stop_proxy("missing").await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let manager = ProxyManager::new();
        let response = manager
            .start_proxy(target(), 0, "127.0.0.1", 80)
            .await
            .unwrap();

        manager.stop_proxy(&response.proxy_id).await.unwrap();
        let err = manager.stop_proxy(&response.proxy_id).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));

        let err = manager
            .get_proxy_status(&response.proxy_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_all_empty() {
        let manager = ProxyManager::new();
        let result = manager.stop_all_proxies().await.unwrap();
        assert_eq!(result.stopped, 0);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let manager = ProxyManager::new();
        for _ in 0..3 {
            manager
                .start_proxy(target(), 0, "127.0.0.1", 80)
                .await
                .unwrap();
        }

        let result = manager.stop_all_proxies().await.unwrap();
        assert_eq!(result.stopped, 3);
        assert!(manager.list_proxies().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_in_start_order() {
        let manager = ProxyManager::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let response = manager
                .start_proxy(target(), 0, "127.0.0.1", 80)
                .await
                .unwrap();
            ids.push(response.proxy_id);
        }

        let first = manager.list_proxies().await;
        let second = manager.list_proxies().await;
        assert_eq!(first.ids(), ids.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(first.ids(), second.ids());
    }
}
