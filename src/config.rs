//! Configuration file and `-L` forward specs

use anyhow::{bail, Context, Result};
use localfwd_proxy::{validate_port, ProxyConfig, ProxyTarget};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Manager tunables
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Descriptor echoed back in every proxy status
    #[serde(default)]
    pub target: ProxyTarget,

    /// Forwards to start
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

/// One local port to remote endpoint mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// 0 means pick a free port
    #[serde(default)]
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Parse `[LOCAL:]HOST:PORT`. IPv6 hosts go in brackets, e.g.
    /// `8080:[::1]:80`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (rest, remote_port) = spec
            .rsplit_once(':')
            .with_context(|| format!("Invalid forward '{}': expected [LOCAL:]HOST:PORT", spec))?;

        let remote_port = validate_port(remote_port)
            .with_context(|| format!("Invalid remote port in '{}'", spec))?;
        if remote_port == 0 {
            bail!("Invalid forward '{}': remote port is required", spec);
        }

        let (local, remote_host) = if let Some(open) = rest.find('[') {
            let close = rest
                .rfind(']')
                .filter(|close| *close == rest.len() - 1)
                .with_context(|| format!("Invalid forward '{}': unterminated '['", spec))?;
            let local = rest[..open].strip_suffix(':').unwrap_or(&rest[..open]);
            (local, &rest[open + 1..close])
        } else {
            let (local, host) = rest.split_once(':').unwrap_or(("", rest));
            if host.contains(':') {
                bail!(
                    "Invalid forward '{}': IPv6 hosts must be bracketed, e.g. [::1]:80",
                    spec
                );
            }
            (local, host)
        };

        if remote_host.is_empty() {
            bail!("Invalid forward '{}': remote host is required", spec);
        }

        let local_port =
            validate_port(local).with_context(|| format!("Invalid local port in '{}'", spec))?;

        Ok(Self {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        })
    }
}

/// Load configuration from a YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}
