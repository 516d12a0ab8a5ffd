//! The metadata service's record of one container or image.
//!
//! Port aliases are stored the way the service returns them: one bucket per
//! (namespace, ip), each holding an ordered list of `[min, max]` ranges per
//! protocol. Ranges are compared by exact equality; overlapping ranges are
//! distinct aliases.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Protocol;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAlias {
    pub ns_name: String,
    pub ip: String,
}

impl IpAlias {
    pub fn new(ns_name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            ns_name: ns_name.into(),
            ip: ip.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPorts {
    #[serde(default)]
    pub tcp: Vec<[u16; 2]>,
    #[serde(default)]
    pub udp: Vec<[u16; 2]>,
}

impl ProtocolPorts {
    pub fn ranges(&self, protocol: Protocol) -> &[[u16; 2]] {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    fn ranges_mut(&mut self, protocol: Protocol) -> &mut Vec<[u16; 2]> {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }
}

/// All port ranges aliased on one (namespace, ip).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAliasBucket {
    pub ns_name: String,
    pub ip: String,
    #[serde(default)]
    pub ports: ProtocolPorts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalAliases {
    #[serde(default)]
    pub ips: Vec<IpAlias>,
    #[serde(default)]
    pub ports: Vec<PortAliasBucket>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsedStatement {
    #[serde(default)]
    pub endorser: String,
    #[serde(default)]
    pub fact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "alias", default)]
    pub aliases: PrincipalAliases,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub statements: Vec<EndorsedStatement>,
}

/// Location of a port range inside a principal, as returned by
/// [`Principal::find_port_alias`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAliasSlot {
    /// No bucket for the (namespace, ip).
    Missing,
    /// The bucket exists but holds no identical range.
    Bucket(usize),
    /// Bucket index and range index.
    Exact(usize, usize),
}

impl Principal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_ip_alias(&self, ns: &str, ip: &str) -> bool {
        self.aliases
            .ips
            .iter()
            .any(|a| a.ns_name == ns && a.ip == ip)
    }

    pub fn has_link(&self, link: &str) -> bool {
        self.links.iter().any(|l| l == link)
    }

    pub fn has_statement(&self, fact: &str) -> bool {
        self.statements.iter().any(|s| s.fact == fact)
    }

    /// Find the bucket for (ns, ip), then the exact range in the protocol's
    /// list.
    pub fn find_port_alias(
        &self,
        ns: &str,
        ip: &str,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> PortAliasSlot {
        let Some(i) = self
            .aliases
            .ports
            .iter()
            .position(|b| b.ns_name == ns && b.ip == ip)
        else {
            return PortAliasSlot::Missing;
        };
        match self.aliases.ports[i]
            .ports
            .ranges(protocol)
            .iter()
            .position(|r| r[0] == min && r[1] == max)
        {
            Some(j) => PortAliasSlot::Exact(i, j),
            None => PortAliasSlot::Bucket(i),
        }
    }

    pub fn has_port_alias(
        &self,
        ns: &str,
        ip: &str,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> bool {
        matches!(
            self.find_port_alias(ns, ip, protocol, min, max),
            PortAliasSlot::Exact(..)
        )
    }

    /// Add a range, merging it into an existing (ns, ip) bucket. An identical
    /// range is rejected.
    pub fn add_port_alias(
        &mut self,
        ns: &str,
        ip: &str,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        match self.find_port_alias(ns, ip, protocol, min, max) {
            PortAliasSlot::Exact(..) => Err(Error::PortAliasExists(format!(
                "{} {} {} {}-{}",
                ns, ip, protocol, min, max
            ))),
            PortAliasSlot::Bucket(i) => {
                self.aliases.ports[i]
                    .ports
                    .ranges_mut(protocol)
                    .push([min, max]);
                Ok(())
            }
            PortAliasSlot::Missing => {
                let mut bucket = PortAliasBucket {
                    ns_name: ns.to_string(),
                    ip: ip.to_string(),
                    ports: ProtocolPorts::default(),
                };
                bucket.ports.ranges_mut(protocol).push([min, max]);
                self.aliases.ports.push(bucket);
                Ok(())
            }
        }
    }

    pub fn del_port_alias(
        &mut self,
        ns: &str,
        ip: &str,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        match self.find_port_alias(ns, ip, protocol, min, max) {
            PortAliasSlot::Exact(i, j) => {
                self.aliases.ports[i].ports.ranges_mut(protocol).remove(j);
                Ok(())
            }
            _ => Err(Error::PortAliasNotFound(format!(
                "{} {} {} {}-{}",
                ns, ip, protocol, min, max
            ))),
        }
    }

    /// Number of individual port ranges held across all buckets.
    pub fn port_alias_count(&self) -> usize {
        self.aliases
            .ports
            .iter()
            .map(|b| b.ports.tcp.len() + b.ports.udp.len())
            .sum()
    }
}
