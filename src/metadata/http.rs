//! HTTP client for the metadata service.
//!
//! Container operations live under `openstack/latest/container_api`, the
//! instance identity under the EC2-style `latest/meta-data` tree. Every
//! argument travels in the query string; mutations answer with a literal
//! `true` on success.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use reqwest::StatusCode;

use super::{MetadataApi, Principal};
use crate::error::{Error, Result};
use crate::types::Protocol;

const CONTAINER_API_PATH: &str = "openstack/latest/container_api";
const INSTANCE_API_PATH: &str = "latest/meta-data";

pub struct HttpMetadataApi {
    client: reqwest::Client,
    addr: String,
}

impl HttpMetadataApi {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Metadata(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            addr: addr.into(),
        })
    }

    fn container_url(&self, endpoint: &str) -> String {
        format!("http://{}/{}{}", self.addr, CONTAINER_API_PATH, endpoint)
    }

    fn instance_url(&self, endpoint: &str) -> String {
        format!("http://{}/{}{}", self.addr, INSTANCE_API_PATH, endpoint)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| Error::Metadata(e.to_string()))
    }

    async fn body(resp: reqwest::Response) -> Result<String> {
        resp.text()
            .await
            .map_err(|e| Error::Metadata(format!("cannot read response: {}", e)))
    }

    /// POST a mutation and check for the `true` acknowledgement.
    async fn mutate(&self, endpoint: &str, params: &[(&str, String)]) -> Result<()> {
        let url = self.container_url(endpoint);
        debug!("metadata POST {} {:?}", url, params);
        let resp = self.send(self.client.post(&url).query(params)).await?;
        acknowledged(&Self::body(resp).await?)
    }

    async fn get_text(&self, url: String) -> Result<String> {
        debug!("metadata GET {}", url);
        let resp = self.send(self.client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(Error::Metadata(format!("{} returned {}", url, resp.status())));
        }
        Ok(Self::body(resp).await?.trim().to_string())
    }

    async fn post_encoded(
        &self,
        endpoint: &str,
        target: &str,
        key: &str,
        items: &[String],
    ) -> Result<()> {
        let encoded = encode_list(items)?;
        self.mutate(endpoint, &[("target", target.to_string()), (key, encoded)])
            .await
    }
}

fn acknowledged(body: &str) -> Result<()> {
    if body.trim().eq_ignore_ascii_case("true") {
        Ok(())
    } else {
        Err(Error::Metadata(format!(
            "metadata server returned: {}",
            body.trim()
        )))
    }
}

/// JSON-encode a list of strings and wrap it in base64.
fn encode_list(items: &[String]) -> Result<String> {
    let json = serde_json::to_vec(items)
        .map_err(|e| Error::Metadata(format!("cannot encode payload: {}", e)))?;
    Ok(BASE64.encode(json))
}

fn port_params(
    id: &str,
    ns: &str,
    ip: IpAddr,
    protocol: Protocol,
    min: u16,
    max: u16,
) -> Vec<(&'static str, String)> {
    vec![
        ("ns_name", ns.to_string()),
        ("principal", id.to_string()),
        ("ip", ip.to_string()),
        ("protocol", protocol.to_string()),
        ("port_min", min.to_string()),
        ("port_max", max.to_string()),
    ]
}

#[async_trait]
impl MetadataApi for HttpMetadataApi {
    async fn create_principal(&self, id: &str) -> Result<()> {
        self.mutate("/create_principal", &[("principal", id.to_string())])
            .await
    }

    async fn delete_principal(&self, id: &str) -> Result<()> {
        self.mutate("/delete_principal", &[("principal", id.to_string())])
            .await
    }

    async fn list_principals(&self) -> Result<Vec<String>> {
        let url = self.container_url("/list_principals");
        debug!("metadata GET {}", url);
        let resp = self.send(self.client.get(&url)).await?;
        let body = Self::body(resp).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Metadata(format!("bad principal list: {}", e)))
    }

    async fn show_principal(&self, id: &str) -> Result<Principal> {
        let url = self.container_url("/show_principal");
        debug!("metadata GET {} principal={}", url, id);
        let resp = self
            .send(self.client.get(&url).query(&[("principal", id)]))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::PrincipalNotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Error::Metadata(format!(
                "show principal {} returned {}",
                id,
                resp.status()
            )));
        }
        let body = Self::body(resp).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Metadata(format!("bad principal {}: {}", id, e)))
    }

    async fn create_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()> {
        self.mutate(
            "/create_ip_alias",
            &[
                ("ns_name", ns.to_string()),
                ("principal", id.to_string()),
                ("ip", ip.to_string()),
            ],
        )
        .await
    }

    async fn delete_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()> {
        self.mutate(
            "/delete_ip_alias",
            &[
                ("ns_name", ns.to_string()),
                ("principal", id.to_string()),
                ("ip", ip.to_string()),
            ],
        )
        .await
    }

    async fn create_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        self.mutate(
            "/create_port_alias",
            &port_params(id, ns, ip, protocol, min, max),
        )
        .await
    }

    async fn delete_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        self.mutate(
            "/delete_port_alias",
            &port_params(id, ns, ip, protocol, min, max),
        )
        .await
    }

    async fn post_proof(&self, id: &str, statements: &[String]) -> Result<()> {
        self.post_encoded("/post_proofs", id, "statements", statements)
            .await
    }

    async fn post_proof_for_child(&self, id: &str, statements: &[String]) -> Result<()> {
        self.post_encoded("/post_proofs_for_child", id, "statements", statements)
            .await
    }

    async fn link_proof(&self, id: &str, deps: &[String]) -> Result<()> {
        self.post_encoded("/link_proofs", id, "dependencies", deps)
            .await
    }

    async fn link_proof_for_child(&self, id: &str, deps: &[String]) -> Result<()> {
        self.post_encoded("/link_proofs_for_child", id, "dependencies", deps)
            .await
    }

    async fn create_ns(&self, ns: &str) -> Result<()> {
        self.mutate("/create_ns", &[("ns_name", ns.to_string())]).await
    }

    async fn join_ns(&self, ns: &str) -> Result<()> {
        self.mutate("/join_ns", &[("ns_name", ns.to_string())]).await
    }

    async fn leave_ns(&self, ns: &str) -> Result<()> {
        self.mutate("/leave_ns", &[("ns_name", ns.to_string())]).await
    }

    async fn delete_ns(&self, ns: &str) -> Result<()> {
        self.mutate("/delete_ns", &[("ns_name", ns.to_string())]).await
    }

    async fn my_public_ip(&self) -> Result<String> {
        self.get_text(self.instance_url("/public-ipv4")).await
    }

    async fn my_local_ip(&self) -> Result<String> {
        self.get_text(self.instance_url("/local-ipv4")).await
    }

    async fn my_ns(&self) -> Result<String> {
        self.get_text(self.container_url("/query_iaas_ns")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledgement_is_case_insensitive() {
        assert!(acknowledged("true").is_ok());
        assert!(acknowledged("TRUE\n").is_ok());
        assert!(acknowledged("false").is_err());
        assert!(acknowledged("").is_err());
    }

    #[test]
    fn lists_are_json_then_base64() {
        let encoded = encode_list(&["a".to_string(), "b".to_string()]).unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, br#"["a","b"]"#);
    }

    #[test]
    fn urls_follow_service_layout() {
        let api = HttpMetadataApi::new("10.1.1.1:8080", Duration::from_secs(1)).unwrap();
        assert_eq!(
            api.container_url("/create_principal"),
            "http://10.1.1.1:8080/openstack/latest/container_api/create_principal"
        );
        assert_eq!(
            api.instance_url("/local-ipv4"),
            "http://10.1.1.1:8080/latest/meta-data/local-ipv4"
        );
    }
}
