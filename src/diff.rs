//! Set differences between locally observed aliases and a principal's.
//!
//! Both diffs compare by exact equality. Port ranges in particular are never
//! coalesced: a local `[1000, 2000]` and a remote `[1000, 1999]` are unrelated
//! aliases, one to create and one to delete.

use crate::metadata::{IpAlias, Principal};
use crate::types::{PortAlias, Protocol};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IpAliasDiff {
    /// Local aliases the principal lacks.
    pub to_create: Vec<IpAlias>,
    /// Principal aliases no longer observed locally.
    pub to_delete: Vec<IpAlias>,
    /// Aliases present on both sides.
    pub retained: Vec<IpAlias>,
}

/// Presence test on (namespace, ip).
pub fn diff_ip_aliases(local: &[IpAlias], remote: &[IpAlias]) -> IpAliasDiff {
    let mut diff = IpAliasDiff::default();
    for (i, alias) in local.iter().enumerate() {
        if local[..i].contains(alias) {
            continue;
        }
        if remote.contains(alias) {
            diff.retained.push(alias.clone());
        } else {
            diff.to_create.push(alias.clone());
        }
    }
    diff.to_delete = remote
        .iter()
        .filter(|alias| !local.contains(alias))
        .cloned()
        .collect();
    diff
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortAliasDiff {
    pub client_only: Vec<PortAlias>,
    pub server_only: Vec<PortAlias>,
    pub mutual: Vec<PortAlias>,
}

/// True if `target` holds exactly this alias.
pub fn port_alias_in(
    target: &[PortAlias],
    ns: &str,
    ip: &str,
    protocol: Protocol,
    min: u16,
    max: u16,
) -> bool {
    target.iter().any(|p| p.matches(ns, ip, protocol, min, max))
}

/// Three-way partition of local port aliases against a principal's.
pub fn diff_port_aliases(local: &[PortAlias], remote: &Principal) -> PortAliasDiff {
    let mut diff = PortAliasDiff::default();

    for port in local {
        if remote.has_port_alias(&port.ns, &port.ip, port.protocol, port.min, port.max) {
            diff.mutual.push(port.clone());
        } else {
            diff.client_only.push(port.clone());
        }
    }

    for bucket in &remote.aliases.ports {
        for protocol in Protocol::ALL {
            for [min, max] in bucket.ports.ranges(protocol) {
                if !port_alias_in(local, &bucket.ns_name, &bucket.ip, protocol, *min, *max) {
                    diff.server_only.push(PortAlias::new(
                        bucket.ns_name.clone(),
                        bucket.ip.clone(),
                        protocol,
                        *min,
                        *max,
                    ));
                }
            }
        }
    }
    diff
}
