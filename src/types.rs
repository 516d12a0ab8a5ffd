//! Value types shared between the snapshot tracker, the reconciliation
//! cache and the monitor.
//!
//! These describe what the host *needs* the metadata service to know about
//! a container: which port ranges must be reachable on which instance
//! identity, and which lifecycle signal a worker has been sent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifiers are truncated to this many characters before they are used
/// as principal names.
pub const ID_TRUNCATE_LEN: usize = 13;

/// Namespace of the host's public network identity.
pub const DEFAULT_NS: &str = "default";

/// Truncate a runtime identifier to its principal name.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(ID_TRUNCATE_LEN) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Strip an algorithm prefix (`sha256:`) from a content id and truncate it.
pub fn short_digest(digest: &str) -> &str {
    let bare = match digest.split_once(':') {
        Some((_, rest)) => rest,
        None => digest,
    };
    short_id(bare)
}

/// Transport protocol of a port alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// One port range a container needs reachable on one (namespace, ip).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortAlias {
    pub ns: String,
    pub ip: String,
    pub protocol: Protocol,
    pub min: u16,
    pub max: u16,
}

impl PortAlias {
    pub fn new(
        ns: impl Into<String>,
        ip: impl Into<String>,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Self {
        Self {
            ns: ns.into(),
            ip: ip.into(),
            protocol,
            min,
            max,
        }
    }

    /// Exact match on all five fields. Overlapping ranges never match.
    pub fn matches(&self, ns: &str, ip: &str, protocol: Protocol, min: u16, max: u16) -> bool {
        self.ns == ns
            && self.ip == ip
            && self.protocol == protocol
            && self.min == min
            && self.max == max
    }
}

impl fmt::Display for PortAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} {}-{}",
            self.ns, self.ip, self.protocol, self.min, self.max
        )
    }
}

/// A network identity of this host instance (e.g. its public or local IP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIp {
    pub ns: String,
    pub ip: String,
}

impl InstanceIp {
    pub fn new(ns: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ip: ip.into(),
        }
    }
}

/// Messages delivered to a per-container worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    /// On-disk state may have changed; reload and reconcile.
    NeedUpdate,
    /// The container directory is gone; clean up and exit.
    Dead,
}
