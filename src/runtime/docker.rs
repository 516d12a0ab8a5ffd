//! Docker's on-disk state and the few live queries the agent makes.
//!
//! Only the fields the agent acts on are decoded; everything else in the
//! runtime's files is ignored.

use super::ContainerRuntime;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const CONTAINER_CONFIG_FILE: &str = "config.v2.json";
pub const HOST_CONFIG_FILE: &str = "hostconfig.json";
pub const IMAGE_REPO_FILE: &str = "repositories.json";
pub const IMAGE_CONTENT_DIR: &str = "imagedb/content/sha256";

/// True if `name` is one of a container directory's two state files.
pub fn is_config_file(name: &str) -> bool {
    name == CONTAINER_CONFIG_FILE || name == HOST_CONFIG_FILE
}

/// Paths of both state files under a container directory.
pub fn config_paths(root: &Path) -> [PathBuf; 2] {
    [root.join(CONTAINER_CONFIG_FILE), root.join(HOST_CONFIG_FILE)]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunConfig {
    #[serde(default)]
    pub network_disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointSettings {
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub sandbox_key: String,
    #[serde(default)]
    pub networks: HashMap<String, EndpointSettings>,
    /// Container port (`80/tcp`) to host bindings; unbound ports map to null.
    #[serde(default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub network_mode: String,
}

impl HostConfig {
    /// A network the user created, as opposed to one of the built-in modes.
    pub fn is_user_defined_network(&self) -> bool {
        let mode = self.network_mode.as_str();
        !(mode.is_empty()
            || mode == "default"
            || mode == "bridge"
            || mode == "host"
            || mode == "none"
            || mode.starts_with("container:"))
    }
}

/// Parsed `config.v2.json` plus `hostconfig.json` of one container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Content id of the image, `sha256:<hex>`.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    #[serde(skip)]
    pub host_config: HostConfig,
}

impl ContainerConfig {
    /// Read both state files under a container directory.
    pub fn from_disk(root: &Path) -> Result<Self> {
        let [config_path, host_path] = config_paths(root);
        let mut config: ContainerConfig = read_json(&config_path)?;
        config.host_config = read_json(&host_path)?;
        Ok(config)
    }

    /// Host ports bound for exposed container ports. Unparsable bindings
    /// are skipped.
    pub fn host_ports(&self) -> Vec<u16> {
        let mut ports = BTreeSet::new();
        for bindings in self.network_settings.ports.values().flatten() {
            for binding in bindings {
                match binding.host_port.parse::<u16>() {
                    Ok(port) => {
                        ports.insert(port);
                    }
                    Err(_) => warn!("cannot parse host port {:?}", binding.host_port),
                }
            }
        }
        ports.into_iter().collect()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ConfigMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// The image repository index: repository name to tag to content id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repositories {
    #[serde(rename = "Repositories", default)]
    pub repos: HashMap<String, HashMap<String, String>>,
}

impl Repositories {
    pub fn load(image_root: &Path) -> Result<Self> {
        read_json(&image_root.join(IMAGE_REPO_FILE))
    }

    /// Every distinct image id referenced by a tag, without its algorithm
    /// prefix.
    pub fn image_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for (repo, tags) in &self.repos {
            for (tag, digest) in tags {
                match digest.split_once(':') {
                    Some((_, id)) if !id.is_empty() => {
                        ids.insert(id.to_string());
                    }
                    _ => warn!("invalid image digest {:?} for {}:{}", digest, repo, tag),
                }
            }
        }
        ids.into_iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub revision: String,
}

/// The part of an image config the agent cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub source: Option<ImageSource>,
}

impl ImageConfig {
    pub fn parse(path: &Path, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Location of an image config in the content-addressed store.
pub fn image_config_path(image_root: &Path, id: &str) -> PathBuf {
    image_root.join(IMAGE_CONTENT_DIR).join(id)
}

/// Parse `ipshow` output: one `<iface> <ip>` pair per line. Any malformed
/// line invalidates the whole listing.
pub fn parse_namespace_ips(output: &str) -> Vec<String> {
    let mut ips = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(_iface), Some(ip)) = (fields.next(), fields.next()) else {
            warn!("error reading namespace IPs at line {:?}", line);
            return Vec::new();
        };
        if ip.parse::<Ipv4Addr>().is_ok() {
            ips.push(ip.to_string());
        }
    }
    ips
}

pub struct DockerRuntime {
    docker: Docker,
    ipshow: String,
}

impl DockerRuntime {
    pub fn connect(ipshow: impl Into<String>) -> Result<Self> {
        // Unix socket on Linux
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self {
            docker,
            ipshow: ipshow.into(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn overlay_networks(&self) -> Result<Vec<String>> {
        let opts = ListNetworksOptions::<String> {
            filters: HashMap::from([("driver".to_string(), vec!["overlay".to_string()])]),
        };
        let networks = self
            .docker
            .list_networks(Some(opts))
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }

    async fn namespace_ips(&self, sandbox_key: &str) -> Vec<String> {
        match Command::new(&self.ipshow).arg(sandbox_key).output().await {
            Ok(out) if out.status.success() => {
                let ips = parse_namespace_ips(&String::from_utf8_lossy(&out.stdout));
                debug!("namespace {} has ips {:?}", sandbox_key, ips);
                ips
            }
            Ok(out) => {
                warn!(
                    "{} {} exited with {}: {}",
                    self.ipshow,
                    sandbox_key,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                warn!("cannot run {} {}: {}", self.ipshow, sandbox_key, e);
                Vec::new()
            }
        }
    }
}
