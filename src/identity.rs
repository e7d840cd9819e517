//! Node and service naming.
//!
//! Every process in the mesh is addressed by a [`NodeId`]: a printable,
//! case-insensitive string chosen by the operator. Comparison is always
//! on the lowercased form, so `Relay-EU` and `relay-eu` are the same
//! node. The name `localhost` (and anything under `localhost.`) is
//! reserved and refused, because it would alias every machine's default
//! hostname onto one mesh address.
//!
//! Services are plain strings bound on a node. Names starting with an
//! ASCII control character are reserved for internal endpoints (the
//! control channel, per-stream ephemeral endpoints, the ping responder)
//! and cannot be bound through the public API.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{NetError, NetResult};

/// Reserved node name, forbidden as an ID.
const RESERVED_NODE_ID: &str = "localhost";

/// Prefix of service names reserved for internal use.
pub(crate) const INTERNAL_PREFIX: char = '\u{1}';

/// Logical address of a node in the mesh.
///
/// Always stored lowercased; constructing one via [`NodeId::parse`]
/// validates it, and equality/hashing operate on the normalized form.
/// Deserialization runs the same validation, so an ID arriving inside
/// any frame body — not just the handshake hello — cannot smuggle in
/// the reserved name, mixed case or control characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NodeId::from_wire(&raw).map_err(serde::de::Error::custom)
    }
}

impl NodeId {
    /// Validate and normalize a node ID.
    ///
    /// Rejects the empty string, non-printable characters, and the
    /// reserved name `localhost`.
    pub fn parse(raw: &str) -> NetResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(NetError::Config("node ID must not be empty".into()));
        }
        if normalized == RESERVED_NODE_ID {
            return Err(NetError::Config(format!(
                "node ID {RESERVED_NODE_ID:?} is reserved"
            )));
        }
        if normalized.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(NetError::Config(format!(
                "node ID {raw:?} contains non-printable characters"
            )));
        }
        Ok(NodeId(normalized))
    }

    /// Derive the default node ID from the local hostname.
    ///
    /// A hostname of `localhost` (or `localhost.<domain>`) cannot be
    /// used as a mesh address, so in that case an explicit ID must be
    /// configured.
    pub fn from_hostname() -> NetResult<Self> {
        let host = gethostname::gethostname()
            .into_string()
            .map_err(|_| NetError::Config("hostname is not valid UTF-8".into()))?;
        let lower = host.to_lowercase();
        if lower == RESERVED_NODE_ID || lower.starts_with("localhost.") {
            return Err(NetError::Config(
                "no node ID specified and local hostname is localhost".into(),
            ));
        }
        NodeId::parse(&host)
    }

    /// Validate a node ID arriving from the wire (a peer's hello or a
    /// frame header). Same rules as [`parse`](Self::parse), but the
    /// failure is a peer problem, not a config problem.
    pub(crate) fn from_wire(raw: &str) -> NetResult<Self> {
        NodeId::parse(raw).map_err(|e| NetError::PolicyReject(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of peers this node will accept links from.
///
/// An empty set means "allow everyone"; a non-empty set is a strict
/// allowlist checked during the link handshake.
#[derive(Clone, Debug, Default)]
pub struct AllowedPeers(HashSet<NodeId>);

impl AllowedPeers {
    pub fn any() -> Self {
        AllowedPeers(HashSet::new())
    }

    pub fn from_ids<I: IntoIterator<Item = NodeId>>(ids: I) -> Self {
        AllowedPeers(ids.into_iter().collect())
    }

    pub fn permits(&self, peer: &NodeId) -> bool {
        self.0.is_empty() || self.0.contains(peer)
    }

    pub fn is_restricted(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Check a service name offered through the public bind API.
///
/// The empty string is forbidden, and names beginning with an ASCII
/// control character are reserved for internal endpoints.
pub(crate) fn validate_public_service(name: &str) -> NetResult<()> {
    if name.is_empty() {
        return Err(NetError::Config("service name must not be empty".into()));
    }
    if name.chars().next().is_some_and(|c| c.is_control()) {
        return Err(NetError::Config(format!(
            "service names starting with a control character are reserved: {name:?}"
        )));
    }
    Ok(())
}

/// True for names under the internal reserved prefix.
pub(crate) fn is_internal_service(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_case_insensitive() {
        let a = NodeId::parse("Relay-EU").unwrap();
        let b = NodeId::parse("relay-eu").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "relay-eu");
    }

    #[test]
    fn localhost_is_reserved() {
        assert!(NodeId::parse("localhost").is_err());
        assert!(NodeId::parse("LOCALHOST").is_err());
        assert!(NodeId::parse("  Localhost ").is_err());
    }

    #[test]
    fn empty_and_unprintable_rejected() {
        assert!(NodeId::parse("").is_err());
        assert!(NodeId::parse("   ").is_err());
        assert!(NodeId::parse("no\ttabs").is_err());
        assert!(NodeId::parse("no\u{1}ctl").is_err());
    }

    #[test]
    fn allowed_peers_empty_permits_all() {
        let any = AllowedPeers::any();
        assert!(any.permits(&NodeId::parse("whoever").unwrap()));

        let strict = AllowedPeers::from_ids([NodeId::parse("b").unwrap()]);
        assert!(strict.permits(&NodeId::parse("B").unwrap()));
        assert!(!strict.permits(&NodeId::parse("c").unwrap()));
    }

    #[test]
    fn reserved_service_names() {
        assert!(validate_public_service("echo").is_ok());
        assert!(validate_public_service("").is_err());
        assert!(validate_public_service("\u{1}control").is_err());
        assert!(is_internal_service("\u{1}s0042"));
        assert!(!is_internal_service("echo"));
    }
}
