//! Packet-filtering rules that route a container's static port range.
//!
//! Each container gets its own nat chain, `ctn-<id>`, jumped to from
//! `POSTROUTING`. The static mapping is one `MASQUERADE --to-ports` rule per
//! protocol for the container's address.

use async_trait::async_trait;
use log::{debug, error};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::types::Protocol;

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn setup_container_chain(&self, id: &str) -> Result<()>;
    async fn remove_container_chain(&self, id: &str) -> Result<()>;
    async fn setup_static_port_mapping(&self, id: &str, ip: &str, min: u16, max: u16)
        -> Result<()>;
    async fn clear_static_port_mapping(&self, id: &str) -> Result<()>;
}

pub fn chain_name(id: &str) -> String {
    format!("ctn-{}", id)
}

pub struct IptablesSandbox {
    binary: String,
}

impl IptablesSandbox {
    pub fn new() -> Self {
        Self {
            binary: "iptables".into(),
        }
    }

    async fn nat(&self, args: &[&str]) -> Result<()> {
        debug!("{} -t nat {}", self.binary, args.join(" "));
        let out = Command::new(&self.binary)
            .arg("-t")
            .arg("nat")
            .args(args)
            .output()
            .await?;
        if out.status.success() {
            return Ok(());
        }
        let mut msg = String::from_utf8_lossy(&out.stdout).into_owned();
        msg.push_str(&String::from_utf8_lossy(&out.stderr));
        Err(Error::Sandbox(format!(
            "iptables -t nat {}: {}",
            args.join(" "),
            msg.trim()
        )))
    }
}

impl Default for IptablesSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for IptablesSandbox {
    async fn setup_container_chain(&self, id: &str) -> Result<()> {
        let chain = chain_name(id);
        self.nat(&["-N", &chain]).await?;
        if let Err(e) = self.nat(&["-I", "POSTROUTING", "-j", &chain]).await {
            error!("error inserting chain {}: {}", chain, e);
            // Leave no orphan chain behind
            let _ = self.nat(&["-X", &chain]).await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove_container_chain(&self, id: &str) -> Result<()> {
        let chain = chain_name(id);
        self.nat(&["-D", "POSTROUTING", "-j", &chain]).await?;
        self.nat(&["-F", &chain]).await?;
        self.nat(&["-X", &chain]).await
    }

    async fn setup_static_port_mapping(
        &self,
        id: &str,
        ip: &str,
        min: u16,
        max: u16,
    ) -> Result<()> {
        let chain = chain_name(id);
        let ports = format!("{}-{}", min, max);
        for proto in Protocol::ALL {
            let args = [
                "-A",
                chain.as_str(),
                "-p",
                proto.as_str(),
                "-d",
                ip,
                "-j",
                "MASQUERADE",
                "--to-ports",
                ports.as_str(),
            ];
            if let Err(e) = self.nat(&args).await {
                error!("error inserting static mapping rule: {}", e);
                let _ = self.nat(&["-F", &chain]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn clear_static_port_mapping(&self, id: &str) -> Result<()> {
        self.nat(&["-F", &chain_name(id)]).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_named_after_container() {
        assert_eq!(chain_name("b3f37be527fa2"), "ctn-b3f37be527fa2");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let sandbox = IptablesSandbox {
            binary: "/nonexistent/iptables".into(),
        };
        assert!(sandbox.clear_static_port_mapping("abc").await.is_err());
    }
}
