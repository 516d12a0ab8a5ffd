//! Best-known remote state of one container's principal, and the steps that
//! converge it with the local snapshot.
//!
//! Every remote mutation is attempted on its own, and its effect on the
//! cached principal depends on whether it succeeded. One failing call never
//! stops the unrelated ones; whatever did not converge is retried on the
//! next pass.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::container::ContainerSnapshot;
use crate::diff::{diff_ip_aliases, diff_port_aliases, PortAliasDiff};
use crate::error::Result;
use crate::metadata::{EndorsedStatement, IpAlias, MetadataApi, Principal};

pub struct ReconcileCache {
    api: Arc<dyn MetadataApi>,
    /// `None` until the principal is known to exist remotely.
    state: Option<Principal>,
    last_refresh: Option<Instant>,
}

impl ReconcileCache {
    pub fn new(api: Arc<dyn MetadataApi>) -> Self {
        Self {
            api,
            state: None,
            last_refresh: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<&Principal> {
        self.state.as_ref()
    }

    pub fn is_created(&self) -> bool {
        self.state.is_some()
    }

    /// True if the last successful refresh is younger than `max_age`.
    pub fn refreshed_within(&self, max_age: Duration) -> bool {
        self.last_refresh.is_some_and(|t| t.elapsed() < max_age)
    }

    /// Replace the cache with the service's current principal. A missing
    /// principal empties the cache.
    pub async fn refresh(&mut self, container: &ContainerSnapshot) -> Result<()> {
        match self.api.show_principal(container.id()).await {
            Ok(principal) => {
                self.state = Some(principal);
                self.last_refresh = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                if e.is_not_found() {
                    self.state = None;
                }
                Err(e)
            }
        }
    }

    /// Create the principal if needed, then converge statements, image link,
    /// IP aliases and port aliases. Only a failed principal creation is
    /// returned; step failures are logged.
    pub async fn create(&mut self, container: &ContainerSnapshot) -> Result<()> {
        let id = container.id();
        if self.state.is_none() {
            self.api.create_principal(id).await?;
            info!("created principal {}", id);
            self.state = Some(Principal::new());
        }
        let api = self.api.as_ref();
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        if let Err(e) = reconcile_statements(api, container, state).await {
            error!("error posting facts for {}: {}", id, e);
        }
        if let Err(e) = reconcile_image_link(api, container, state).await {
            error!("error linking image for {}: {}", id, e);
        }
        reconcile_ip_aliases(api, container, state).await;
        reconcile_port_aliases(api, container, state).await;
        debug!(
            "principal {} holds {} ip and {} port aliases",
            id,
            state.aliases.ips.len(),
            state.port_alias_count()
        );
        Ok(())
    }

    /// Delete the principal if it was created. On failure the cache is kept
    /// so a later pass retries.
    pub async fn remove(&mut self, container: &ContainerSnapshot) -> Result<()> {
        if self.state.is_some() {
            self.api.delete_principal(container.id()).await?;
            info!("removed principal {}", container.id());
            self.state = None;
        }
        Ok(())
    }
}

/// Posted facts are recorded before the post completes and never rolled
/// back: a failed post is not resent.
async fn reconcile_statements(
    api: &dyn MetadataApi,
    container: &ContainerSnapshot,
    state: &mut Principal,
) -> Result<()> {
    let mut to_post = Vec::new();
    for fact in container.container_facts() {
        if state.has_statement(&fact) {
            debug!("statement {} exists", fact);
        } else {
            to_post.push(fact);
        }
    }
    if to_post.is_empty() {
        return Ok(());
    }
    state
        .statements
        .extend(to_post.iter().map(|fact| EndorsedStatement {
            endorser: String::new(),
            fact: fact.clone(),
        }));
    api.post_proof_for_child(container.id(), &to_post).await
}

async fn reconcile_image_link(
    api: &dyn MetadataApi,
    container: &ContainerSnapshot,
    state: &mut Principal,
) -> Result<()> {
    let Some(image) = container.image_id() else {
        return Ok(());
    };
    if state.has_link(image) {
        debug!("image {} already linked to {}", image, container.id());
        return Ok(());
    }
    state.links.push(image.to_string());
    api.link_proof_for_child(container.id(), &[image.to_string()])
        .await
}

async fn reconcile_ip_aliases(
    api: &dyn MetadataApi,
    container: &ContainerSnapshot,
    state: &mut Principal,
) {
    let id = container.id();
    let local: Vec<IpAlias> = container
        .ips()
        .iter()
        .filter_map(|ip| match container.resolve_namespace(ip) {
            Ok(ns) => Some(IpAlias::new(ns, ip.clone())),
            // not on an attached network, nothing to attest
            Err(_) => None,
        })
        .collect();

    let diff = diff_ip_aliases(&local, &state.aliases.ips);
    let mut latest = diff.retained;

    for alias in diff.to_create {
        let Ok(ip) = alias.ip.parse::<IpAddr>() else {
            warn!("skipping invalid ip {}", alias.ip);
            continue;
        };
        match api.create_ip_alias(id, &alias.ns_name, ip).await {
            Ok(()) => latest.push(alias),
            Err(e) => error!(
                "fail to create ip alias {} {} for {}: {}",
                alias.ns_name, alias.ip, id, e
            ),
        }
    }

    for alias in diff.to_delete {
        let deleted = match alias.ip.parse::<IpAddr>() {
            Ok(ip) => api.delete_ip_alias(id, &alias.ns_name, ip).await,
            Err(_) => {
                warn!("cannot delete invalid ip alias {}", alias.ip);
                latest.push(alias);
                continue;
            }
        };
        if let Err(e) = deleted {
            error!(
                "fail to delete ip alias {} {} for {}: {}",
                alias.ns_name, alias.ip, id, e
            );
            latest.push(alias);
        }
    }
    state.aliases.ips = latest;
}

async fn reconcile_port_aliases(
    api: &dyn MetadataApi,
    container: &ContainerSnapshot,
    state: &mut Principal,
) {
    let id = container.id();
    let local = container.port_aliases();
    let PortAliasDiff {
        client_only,
        server_only,
        mut mutual,
    } = diff_port_aliases(&local, state);

    for port in client_only {
        let Ok(ip) = port.ip.parse::<IpAddr>() else {
            warn!("skipping port alias with invalid ip {}", port);
            continue;
        };
        match api
            .create_port_alias(id, &port.ns, ip, port.protocol, port.min, port.max)
            .await
        {
            Ok(()) => mutual.push(port),
            Err(e) => error!("fail to create port alias {} for {}: {}", port, id, e),
        }
    }

    for port in server_only {
        let Ok(ip) = port.ip.parse::<IpAddr>() else {
            mutual.push(port);
            continue;
        };
        if let Err(e) = api
            .delete_port_alias(id, &port.ns, ip, port.protocol, port.min, port.max)
            .await
        {
            error!("fail to delete port alias {} for {}: {}", port, id, e);
            mutual.push(port);
        }
    }

    state.aliases.ports.clear();
    for port in &mutual {
        // an identical range is already held
        let _ = state.add_port_alias(&port.ns, &port.ip, port.protocol, port.min, port.max);
    }
}
