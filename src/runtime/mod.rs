use crate::error::Result;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

/// Live queries against the container runtime that cannot be answered from
/// its on-disk state files.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of the overlay networks currently visible on this host.
    async fn overlay_networks(&self) -> Result<Vec<String>>;

    /// IPv4 addresses assigned inside the network namespace behind
    /// `sandbox_key`. An unreadable namespace yields an empty list.
    async fn namespace_ips(&self, sandbox_key: &str) -> Vec<String>;
}
