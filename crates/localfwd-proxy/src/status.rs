//! Caller-facing records
//!
//! These are the snapshots handed back to whoever drives the manager. They
//! serialize with camelCase keys so they can be printed or shipped as JSON
//! without another mapping layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What is being proxied. Passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub project: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProxyTarget {
    pub fn new(project: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            service: service.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Active,
    Stopped,
    Error,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Active => "active",
            ProxyState::Stopped => "stopped",
            ProxyState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProxyState::Active)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by `start_proxy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub proxy_id: String,
    pub target: ProxyTarget,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub status: ProxyState,
    /// RFC 3339 timestamp
    pub started_at: String,
}

/// Point-in-time view of a session including traffic counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    #[serde(flatten)]
    pub proxy: ProxyResponse,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Currently open forwarded connections
    pub connections_in: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyStatus {
    pub fn proxy_id(&self) -> &str {
        &self.proxy.proxy_id
    }

    pub fn status(&self) -> ProxyState {
        self.proxy.status
    }

    pub fn local_port(&self) -> u16 {
        self.proxy.local_port
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyListResponse {
    pub proxies: Vec<ProxyStatus>,
}

impl ProxyListResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.proxies.iter().map(|p| p.proxy_id()).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAllResponse {
    pub stopped: usize,
}
