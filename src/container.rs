//! Locally observed state of one container.
//!
//! A snapshot caches the parsed state files of a container directory and
//! decides from file modification times whether they must be read again.
//! A snapshot whose configuration is `None` is unloaded.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::runtime::docker::{config_paths, ContainerConfig};
use crate::runtime::ContainerRuntime;
use crate::types::{short_digest, short_id, InstanceIp, PortAlias, PortRange, Protocol};

/// Read-only view of a snapshot, published by its worker for the dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub root: PathBuf,
    pub loaded: bool,
    pub running: bool,
    pub ips: Vec<String>,
    pub static_range: Option<PortRange>,
    /// The principal is known to exist on the metadata service.
    pub registered: bool,
}

#[derive(Debug)]
pub struct ContainerSnapshot {
    id: String,
    root: PathBuf,
    last_update: Option<SystemTime>,
    config: Option<ContainerConfig>,
    ips: Vec<String>,
    static_range: Option<PortRange>,
    instance_ips: Vec<InstanceIp>,
    host_network: String,
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ContainerSnapshot {
    pub fn new(
        id: &str,
        root: impl Into<PathBuf>,
        instance_ips: Vec<InstanceIp>,
        host_network: impl Into<String>,
    ) -> Self {
        Self {
            id: short_id(id).to_string(),
            root: root.into(),
            last_update: None,
            config: None,
            ips: Vec::new(),
            static_range: None,
            instance_ips,
            host_network: host_network.into(),
        }
    }

    /// Principal name of the container.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.state.running)
    }

    pub fn static_range(&self) -> Option<PortRange> {
        self.static_range
    }

    pub fn assign_static_range(&mut self, range: PortRange) {
        self.static_range = Some(range);
    }

    /// Forget the static range, handing it back to the caller for release.
    pub fn take_static_range(&mut self) -> Option<PortRange> {
        self.static_range.take()
    }

    /// True if the state files changed since the last load.
    ///
    /// A missing state file means there is nothing to load yet: the snapshot
    /// is unloaded and reported fresh.
    pub fn is_stale(&mut self) -> bool {
        if self.config.is_none() {
            return true;
        }
        for path in config_paths(&self.root) {
            let Some(mtime) = modified(&path) else {
                self.config = None;
                return false;
            };
            if self.last_update.map_or(true, |last| last < mtime) {
                debug!("{} is newer than last load", path.display());
                return true;
            }
        }
        false
    }

    /// Newest mtime of both state files. `None` when either is missing.
    fn record_timestamp(&mut self) {
        let mut newest = None;
        for path in config_paths(&self.root) {
            match modified(&path) {
                Some(mtime) => newest = newest.max(Some(mtime)),
                None => {
                    warn!("{} gone during loading", path.display());
                    self.config = None;
                    return;
                }
            }
        }
        self.last_update = newest;
    }

    /// Reload the state files if stale. Returns true when new state was
    /// loaded.
    ///
    /// The timestamp is taken before parsing, so a write landing between the
    /// two is only picked up by a later pass.
    pub async fn reload(&mut self, runtime: &dyn ContainerRuntime) -> bool {
        if !self.is_stale() {
            // the namespace may get its address after the state files settle
            if self.is_running() && self.ips.is_empty() {
                return self.query_ips(runtime).await;
            }
            return false;
        }
        let previous = self.last_update;
        self.record_timestamp();

        let config = match ContainerConfig::from_disk(&self.root) {
            Ok(config) => config,
            Err(e) => {
                warn!("error loading container {}: {}", self.id, e);
                self.last_update = previous;
                return false;
            }
        };
        self.config = Some(config);
        self.ips.clear();
        if self.is_running() {
            self.query_ips(runtime).await;
        }
        true
    }

    /// Read the container's addresses from its network namespace. Returns
    /// true when any were found.
    async fn query_ips(&mut self, runtime: &dyn ContainerRuntime) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let sandbox_key = config.network_settings.sandbox_key.clone();
        let network_disabled = config.config.network_disabled;
        if sandbox_key.is_empty() {
            return false;
        }
        let ips = runtime.namespace_ips(&sandbox_key).await;
        if ips.is_empty() && !network_disabled {
            warn!("container {} has no ip in {} yet", self.id, sandbox_key);
        }
        self.ips = ips;
        !self.ips.is_empty()
    }

    /// True if `ip` is the container's address on the host-connected
    /// network, or, for a user-defined network mode whose networks are not
    /// listed by name, one of the addresses found in its namespace.
    pub fn owns_ip(&self, ip: &str) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let on_host_network = config
            .network_settings
            .networks
            .iter()
            .any(|(name, ep)| ep.ip_address == ip && *name == self.host_network);
        on_host_network
            || (config.host_config.is_user_defined_network() && self.ips.iter().any(|i| i == ip))
    }

    /// Id of the attached network holding `ip`.
    pub fn resolve_namespace(&self, ip: &str) -> Result<String> {
        self.config
            .iter()
            .flat_map(|c| c.network_settings.networks.values())
            .find(|ep| ep.ip_address == ip)
            .map(|ep| ep.network_id.clone())
            .ok_or_else(|| Error::NamespaceNotFound(ip.to_string()))
    }

    /// Principal name of the image the container runs.
    pub fn image_id(&self) -> Option<&str> {
        self.config.as_ref().map(|c| short_digest(&c.image))
    }

    pub fn container_facts(&self) -> Vec<String> {
        match self.image_id() {
            Some(image) => vec![format!("containerFact(\"{}\", \"{}\")", self.id, image)],
            None => Vec::new(),
        }
    }

    /// Port ranges that must be reachable on every instance identity: each
    /// bound host port, plus the static range if one is assigned. Both
    /// protocols, no duplicates.
    pub fn port_aliases(&self) -> Vec<PortAlias> {
        let Some(config) = &self.config else {
            return Vec::new();
        };
        let ranges = config
            .host_ports()
            .into_iter()
            .map(|p| PortRange::new(p, p))
            .chain(self.static_range);

        let mut aliases: Vec<PortAlias> = Vec::new();
        for range in ranges {
            for protocol in Protocol::ALL {
                for vm in &self.instance_ips {
                    let alias = PortAlias::new(&vm.ns, &vm.ip, protocol, range.min, range.max);
                    if !aliases.contains(&alias) {
                        aliases.push(alias);
                    }
                }
            }
        }
        aliases
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            root: self.root.clone(),
            loaded: self.is_loaded(),
            running: self.is_running(),
            ips: self.ips.clone(),
            static_range: self.static_range,
            registered: false,
        }
    }
}

/// A loaded, running container that never touched disk, shaped like the
/// metadata fixtures: overlay address on `overlay_id`, an extra bridge
/// address, both stub instance identities.
#[cfg(test)]
pub fn stub_snapshot(
    id: &str,
    image: &str,
    overlay_ip: &str,
    overlay_id: &str,
    static_range: Option<PortRange>,
    exposed: &[u16],
) -> ContainerSnapshot {
    use crate::metadata::stub::{STUB_LOCAL_IP, STUB_LOCAL_NS, STUB_PUBLIC_IP};
    use crate::runtime::docker::HostConfig;
    use crate::types::DEFAULT_NS;

    let ports: serde_json::Map<String, serde_json::Value> = exposed
        .iter()
        .enumerate()
        .map(|(i, p)| {
            (
                format!("{}/tcp", i),
                serde_json::json!([{"HostIp": "0.0.0.0", "HostPort": p.to_string()}]),
            )
        })
        .collect();
    let mut config: ContainerConfig = serde_json::from_value(serde_json::json!({
        "ID": id,
        "Image": image,
        "State": {"Running": true},
        "NetworkSettings": {
            "SandboxKey": "/var/run/docker/netns/stub",
            "Networks": {
                overlay_id: {"NetworkID": overlay_id, "IPAddress": overlay_ip},
            },
            "Ports": ports,
        }
    }))
    .unwrap();
    config.host_config = HostConfig {
        network_mode: "userdefined".into(),
    };

    let mut snapshot = ContainerSnapshot::new(
        id,
        format!("/nonexistent/{}", id),
        vec![
            InstanceIp::new(DEFAULT_NS, STUB_PUBLIC_IP),
            InstanceIp::new(STUB_LOCAL_NS, STUB_LOCAL_IP),
        ],
        "bridge",
    );
    snapshot.config = Some(config);
    snapshot.ips = vec![overlay_ip.to_string()];
    snapshot.static_range = static_range;
    snapshot
}
