//! Capability interface to the remote metadata service.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Protocol;

pub mod http;
pub mod principal;
#[cfg(test)]
pub mod stub;

pub use http::HttpMetadataApi;
pub use principal::{EndorsedStatement, IpAlias, PortAliasBucket, Principal};

/// Operations the agent needs from the metadata service.
///
/// Every mutation either succeeds or fails with an opaque message. The only
/// error a caller may inspect is `PrincipalNotFound` from
/// [`show_principal`](MetadataApi::show_principal).
#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn create_principal(&self, id: &str) -> Result<()>;
    async fn delete_principal(&self, id: &str) -> Result<()>;
    async fn list_principals(&self) -> Result<Vec<String>>;
    async fn show_principal(&self, id: &str) -> Result<Principal>;

    async fn create_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()>;
    async fn delete_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()>;
    async fn create_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()>;
    async fn delete_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()>;

    async fn post_proof(&self, id: &str, statements: &[String]) -> Result<()>;
    /// Post statements attributed to `id` as a sub-entity of the caller.
    async fn post_proof_for_child(&self, id: &str, statements: &[String]) -> Result<()>;
    async fn link_proof(&self, id: &str, deps: &[String]) -> Result<()>;
    async fn link_proof_for_child(&self, id: &str, deps: &[String]) -> Result<()>;

    async fn create_ns(&self, ns: &str) -> Result<()>;
    async fn join_ns(&self, ns: &str) -> Result<()>;
    async fn leave_ns(&self, ns: &str) -> Result<()>;
    async fn delete_ns(&self, ns: &str) -> Result<()>;

    async fn my_public_ip(&self) -> Result<String>;
    async fn my_local_ip(&self) -> Result<String>;
    async fn my_ns(&self) -> Result<String>;
}
