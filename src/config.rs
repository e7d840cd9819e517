//! Declarative node configuration.
//!
//! One YAML file describes a node: its identity, the backends it
//! listens and dials on, proxy services, and the control channel.
//!
//! ```yaml
//! node:
//!   id: relay-eu
//!   allowed-peers: [hub, relay-us]
//!   data-dir: /var/lib/trellis
//! log-level: info
//! backends:
//!   - type: tcp-listener
//!     address: 0.0.0.0:7323
//!     cost: 1.0
//!     node-costs:
//!       relay-us: 2.0
//!   - type: ws-peer
//!     address: ws://hub.example.net:8080/mesh
//! services:
//!   - type: unix-proxy-outbound
//!     service: payloads
//!     filename: /run/payloads.sock
//! control-service:
//!   service: control
//! ```
//!
//! Stanzas form an explicit registry: the binary collects them from the
//! parsed file and calls `prepare()` on each (validation, fatal at
//! startup) followed by `run(&node)` (instantiate and attach). Nothing
//! registers itself through side effects, so ordering is deterministic
//! and stanzas are unit-testable in isolation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::backend::Backend;
use crate::error::NetError;
use crate::identity::{AllowedPeers, NodeId};
use crate::node::{Node, NodeSettings};
use crate::transport::{
    TcpDialerBackend, TcpListenerBackend, UdpDialerBackend, UdpListenerBackend, WsDialerBackend,
    WsListenerBackend,
};
#[cfg(unix)]
use crate::transport::{UnixDialerBackend, UnixListenerBackend};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<NetError> for ConfigError {
    fn from(e: NetError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

fn default_cost() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_control_name() -> String {
    crate::control::CONTROL_SERVICE.to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub node: NodeStanza,
    /// Log filter applied unless `RUST_LOG` overrides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub backends: Vec<BackendStanza>,
    #[serde(default)]
    pub services: Vec<ServiceStanza>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_service: Option<ControlStanza>,
}

/// `node:` stanza.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NodeStanza {
    /// Node ID. Defaults to the local hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Peers allowed to establish links; empty allows everyone.
    #[serde(default)]
    pub allowed_peers: Vec<String>,
    /// Directory handed through to state-bearing consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// `control-service:` stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ControlStanza {
    #[serde(default = "default_control_name")]
    pub service: String,
}

/// One backend listener or dialer.
///
/// The `tls` fields are opaque references for an external TLS provider
/// and are passed through untouched; the core runs plaintext sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum BackendStanza {
    TcpListener {
        address: String,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default)]
        node_costs: HashMap<String, f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<String>,
    },
    TcpPeer {
        address: String,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default = "default_true")]
        redial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<String>,
    },
    UdpListener {
        address: String,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default)]
        node_costs: HashMap<String, f64>,
    },
    UdpPeer {
        address: String,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default = "default_true")]
        redial: bool,
    },
    UnixListener {
        path: PathBuf,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default)]
        node_costs: HashMap<String, f64>,
    },
    UnixPeer {
        path: PathBuf,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default = "default_true")]
        redial: bool,
    },
    WsListener {
        address: String,
        #[serde(default = "default_ws_path")]
        path: String,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default)]
        node_costs: HashMap<String, f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<String>,
    },
    WsPeer {
        address: String,
        /// One extra HTTP header on the upgrade request, `name: value`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra_header: Option<String>,
        #[serde(default = "default_cost")]
        cost: f64,
        #[serde(default = "default_true")]
        redial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tls: Option<String>,
    },
}

impl BackendStanza {
    /// Stable identity used to match stanzas across reloads.
    pub fn key(&self) -> String {
        match self {
            BackendStanza::TcpListener { address, .. } => format!("tcp-listener {address}"),
            BackendStanza::TcpPeer { address, .. } => format!("tcp-peer {address}"),
            BackendStanza::UdpListener { address, .. } => format!("udp-listener {address}"),
            BackendStanza::UdpPeer { address, .. } => format!("udp-peer {address}"),
            BackendStanza::UnixListener { path, .. } => {
                format!("unix-listener {}", path.display())
            }
            BackendStanza::UnixPeer { path, .. } => format!("unix-peer {}", path.display()),
            BackendStanza::WsListener { address, path, .. } => {
                format!("ws-listener {address}{path}")
            }
            BackendStanza::WsPeer { address, .. } => format!("ws-peer {address}"),
        }
    }

    /// A listener cannot rebind its address in place, so only dialers
    /// are added live on reload.
    pub fn is_listener(&self) -> bool {
        matches!(
            self,
            BackendStanza::TcpListener { .. }
                | BackendStanza::UdpListener { .. }
                | BackendStanza::UnixListener { .. }
                | BackendStanza::WsListener { .. }
        )
    }

    pub fn cost(&self) -> f64 {
        match self {
            BackendStanza::TcpListener { cost, .. }
            | BackendStanza::TcpPeer { cost, .. }
            | BackendStanza::UdpListener { cost, .. }
            | BackendStanza::UdpPeer { cost, .. }
            | BackendStanza::UnixListener { cost, .. }
            | BackendStanza::UnixPeer { cost, .. }
            | BackendStanza::WsListener { cost, .. }
            | BackendStanza::WsPeer { cost, .. } => *cost,
        }
    }

    fn raw_node_costs(&self) -> Option<&HashMap<String, f64>> {
        match self {
            BackendStanza::TcpListener { node_costs, .. }
            | BackendStanza::UdpListener { node_costs, .. }
            | BackendStanza::UnixListener { node_costs, .. }
            | BackendStanza::WsListener { node_costs, .. } => Some(node_costs),
            _ => None,
        }
    }

    /// Parsed per-peer cost overrides.
    pub fn node_costs(&self) -> Result<HashMap<NodeId, f64>, ConfigError> {
        let Some(raw) = self.raw_node_costs() else {
            return Ok(HashMap::new());
        };
        let mut parsed = HashMap::new();
        for (peer, cost) in raw {
            parsed.insert(NodeId::parse(peer)?, *cost);
        }
        Ok(parsed)
    }

    /// Validate without touching the network.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        if !(self.cost() > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "{}: connection cost must be positive",
                self.key()
            )));
        }
        if let Some(raw) = self.raw_node_costs() {
            for (peer, cost) in raw {
                if !(*cost > 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: connection cost must be positive for {peer}",
                        self.key()
                    )));
                }
                NodeId::parse(peer)?;
            }
        }
        match self {
            BackendStanza::WsPeer {
                address,
                extra_header,
                ..
            } => {
                if !address.starts_with("ws://") {
                    return Err(ConfigError::Invalid(format!(
                        "ws-peer address must be a ws:// URL, got {address:?}"
                    )));
                }
                if let Some(header) = extra_header {
                    if !header.contains(':') {
                        return Err(ConfigError::Invalid(format!(
                            "extra-header must be in the form name:value, got {header:?}"
                        )));
                    }
                }
            }
            #[cfg(not(unix))]
            BackendStanza::UnixListener { .. } | BackendStanza::UnixPeer { .. } => {
                return Err(ConfigError::Invalid(
                    "unix socket backends are not available on this platform".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Instantiate the backend. Listener binding happens on attach.
    pub fn build(&self) -> Result<Box<dyn Backend>, ConfigError> {
        if let BackendStanza::TcpListener { tls: Some(_), .. }
        | BackendStanza::TcpPeer { tls: Some(_), .. }
        | BackendStanza::WsListener { tls: Some(_), .. }
        | BackendStanza::WsPeer { tls: Some(_), .. } = self
        {
            warn!(stanza = %self.key(), "tls reference present but no provider is wired in; running plaintext");
        }
        Ok(match self {
            BackendStanza::TcpListener { address, .. } => {
                Box::new(TcpListenerBackend::new(address.clone()))
            }
            BackendStanza::TcpPeer {
                address, redial, ..
            } => Box::new(TcpDialerBackend::new(address.clone(), *redial)),
            BackendStanza::UdpListener { address, .. } => {
                Box::new(UdpListenerBackend::new(address.clone()))
            }
            BackendStanza::UdpPeer {
                address, redial, ..
            } => Box::new(UdpDialerBackend::new(address.clone(), *redial)),
            #[cfg(unix)]
            BackendStanza::UnixListener { path, .. } => {
                Box::new(UnixListenerBackend::new(path.clone()))
            }
            #[cfg(unix)]
            BackendStanza::UnixPeer { path, redial, .. } => {
                Box::new(UnixDialerBackend::new(path.clone(), *redial))
            }
            #[cfg(not(unix))]
            BackendStanza::UnixListener { .. } | BackendStanza::UnixPeer { .. } => {
                return Err(ConfigError::Invalid(
                    "unix socket backends are not available on this platform".into(),
                ))
            }
            BackendStanza::WsListener { address, path, .. } => {
                Box::new(WsListenerBackend::new(address.clone(), path.clone()))
            }
            BackendStanza::WsPeer {
                address,
                extra_header,
                redial,
                ..
            } => {
                let header = extra_header.as_ref().map(|h| {
                    let (name, value) = h.split_once(':').expect("validated in prepare");
                    (name.trim().to_string(), value.trim().to_string())
                });
                Box::new(WsDialerBackend::new(address.clone(), header, *redial))
            }
        })
    }
}

/// One proxy service stanza.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ServiceStanza {
    UnixProxyInbound {
        /// Socket file to listen on; overwritten if present.
        filename: PathBuf,
        remote_node: String,
        remote_service: String,
    },
    UnixProxyOutbound {
        service: String,
        /// Socket file to connect to; must already exist.
        filename: PathBuf,
    },
    TcpProxyInbound {
        address: String,
        remote_node: String,
        remote_service: String,
    },
    TcpProxyOutbound {
        service: String,
        address: String,
    },
}

impl ServiceStanza {
    pub fn key(&self) -> String {
        match self {
            ServiceStanza::UnixProxyInbound { filename, .. } => {
                format!("unix-proxy-inbound {}", filename.display())
            }
            ServiceStanza::UnixProxyOutbound { service, .. } => {
                format!("unix-proxy-outbound {service}")
            }
            ServiceStanza::TcpProxyInbound { address, .. } => {
                format!("tcp-proxy-inbound {address}")
            }
            ServiceStanza::TcpProxyOutbound { service, .. } => {
                format!("tcp-proxy-outbound {service}")
            }
        }
    }

    pub fn prepare(&self) -> Result<(), ConfigError> {
        match self {
            ServiceStanza::UnixProxyInbound { remote_node, .. }
            | ServiceStanza::TcpProxyInbound { remote_node, .. } => {
                NodeId::parse(remote_node)?;
            }
            ServiceStanza::UnixProxyOutbound { service, .. }
            | ServiceStanza::TcpProxyOutbound { service, .. } => {
                if service.is_empty() {
                    return Err(ConfigError::Invalid("service name must not be empty".into()));
                }
            }
        }
        #[cfg(not(unix))]
        if matches!(
            self,
            ServiceStanza::UnixProxyInbound { .. } | ServiceStanza::UnixProxyOutbound { .. }
        ) {
            return Err(ConfigError::Invalid(
                "unix proxy services are not available on this platform".into(),
            ));
        }
        Ok(())
    }

    /// Start the proxy in the background.
    pub fn run(&self, node: &Node) -> Result<(), ConfigError> {
        let key = self.key();
        match self.clone() {
            #[cfg(unix)]
            ServiceStanza::UnixProxyInbound {
                filename,
                remote_node,
                remote_service,
            } => {
                let remote = NodeId::parse(&remote_node)?;
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::proxy::unix_proxy_inbound(node, filename, remote, remote_service)
                            .await
                    {
                        warn!(stanza = %key, error = %e, "proxy service stopped");
                    }
                });
            }
            #[cfg(unix)]
            ServiceStanza::UnixProxyOutbound { service, filename } => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::proxy::unix_proxy_outbound(node, service, filename).await
                    {
                        warn!(stanza = %key, error = %e, "proxy service stopped");
                    }
                });
            }
            ServiceStanza::TcpProxyInbound {
                address,
                remote_node,
                remote_service,
            } => {
                let remote = NodeId::parse(&remote_node)?;
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::proxy::tcp_proxy_inbound(node, address, remote, remote_service)
                            .await
                    {
                        warn!(stanza = %key, error = %e, "proxy service stopped");
                    }
                });
            }
            ServiceStanza::TcpProxyOutbound { service, address } => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = crate::proxy::tcp_proxy_outbound(node, service, address).await
                    {
                        warn!(stanza = %key, error = %e, "proxy service stopped");
                    }
                });
            }
            #[cfg(not(unix))]
            ServiceStanza::UnixProxyInbound { .. } | ServiceStanza::UnixProxyOutbound { .. } => {
                return Err(ConfigError::Invalid(
                    "unix proxy services are not available on this platform".into(),
                ))
            }
        }
        Ok(())
    }
}

/// Load and parse a configuration file.
pub fn load(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        source,
    })
}

impl FileConfig {
    /// Validate the whole file; fatal at startup on error.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.node.id {
            NodeId::parse(id)?;
        }
        for peer in &self.node.allowed_peers {
            NodeId::parse(peer)?;
        }
        for backend in &self.backends {
            backend.prepare()?;
        }
        for service in &self.services {
            service.prepare()?;
        }
        Ok(())
    }

    /// Resolve node settings, deriving the ID from the hostname when
    /// unset and creating the data directory when configured.
    pub fn node_settings(&self) -> Result<NodeSettings, ConfigError> {
        let id = match &self.node.id {
            Some(id) => NodeId::parse(id)?,
            None => NodeId::from_hostname()?,
        };
        let mut allowed = Vec::new();
        for peer in &self.node.allowed_peers {
            allowed.push(NodeId::parse(peer)?);
        }
        let mut settings = NodeSettings::new(id).allowed_peers(if allowed.is_empty() {
            AllowedPeers::any()
        } else {
            AllowedPeers::from_ids(allowed)
        });
        if let Some(dir) = &self.node.data_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                ConfigError::Invalid(format!(
                    "cannot create data directory {}: {e}",
                    dir.display()
                ))
            })?;
            settings = settings.data_dir(dir.clone());
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> FileConfig {
        serde_yaml::from_str(yaml).expect("parse")
    }

    #[test]
    fn full_example_parses_and_prepares() {
        let cfg = parse(
            r#"
node:
  id: relay-eu
  allowed-peers: [hub, relay-us]
log-level: debug
backends:
  - type: tcp-listener
    address: 0.0.0.0:7323
    node-costs:
      relay-us: 2.0
  - type: ws-peer
    address: ws://hub.example.net:8080/mesh
    extra-header: "Authorization: Bearer xyz"
  - type: udp-peer
    address: 10.0.0.2:7324
    cost: 3.5
    redial: false
services:
  - type: tcp-proxy-outbound
    service: payloads
    address: 127.0.0.1:9000
control-service:
  service: control
"#,
        );
        cfg.prepare().expect("valid config");
        assert_eq!(cfg.backends.len(), 3);
        assert_eq!(cfg.backends[0].cost(), 1.0);
        assert!(cfg.backends[0].is_listener());
        assert!(!cfg.backends[2].is_listener());
        let overrides = cfg.backends[0].node_costs().unwrap();
        assert_eq!(
            overrides.get(&NodeId::parse("relay-us").unwrap()),
            Some(&2.0)
        );
    }

    #[test]
    fn non_positive_cost_is_fatal() {
        let cfg = parse(
            r#"
backends:
  - type: tcp-listener
    address: 0.0.0.0:7323
    cost: 0.0
"#,
        );
        assert!(matches!(cfg.prepare(), Err(ConfigError::Invalid(_))));

        let cfg = parse(
            r#"
backends:
  - type: tcp-listener
    address: 0.0.0.0:7323
    node-costs:
      b: -1.0
"#,
        );
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn reserved_node_id_is_fatal() {
        let cfg = parse("node:\n  id: localhost\n");
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn ws_peer_requires_ws_url_and_wellformed_header() {
        let cfg = parse(
            r#"
backends:
  - type: ws-peer
    address: http://example.net/mesh
"#,
        );
        assert!(cfg.prepare().is_err());

        let cfg = parse(
            r#"
backends:
  - type: ws-peer
    address: ws://example.net/mesh
    extra-header: "no-colon-here"
"#,
        );
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res: Result<FileConfig, _> = serde_yaml::from_str(
            r#"
node:
  id: a
  mystery-knob: true
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn stanza_keys_are_stable_across_reloads() {
        let a = parse("backends:\n  - type: tcp-peer\n    address: h:1\n    cost: 1.0\n");
        let b = parse("backends:\n  - type: tcp-peer\n    address: h:1\n    cost: 3.0\n");
        assert_eq!(a.backends[0].key(), b.backends[0].key());
        assert_ne!(a.backends[0], b.backends[0]);
    }
}
