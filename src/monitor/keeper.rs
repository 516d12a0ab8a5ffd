//! Per-container worker.
//!
//! A keeper exclusively owns one container's snapshot and reconciliation
//! cache and processes that container's events in order. Everything that
//! talks to the metadata service or the sandbox for a container happens here.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::container::{ContainerSnapshot, ContainerSummary};
use crate::metadata::MetadataApi;
use crate::ports::StaticPortAllocator;
use crate::reconcile::ReconcileCache;
use crate::runtime::ContainerRuntime;
use crate::sandbox::Sandbox;
use crate::types::ContainerEvent;

/// Collaborators shared by every keeper.
#[derive(Clone)]
pub struct KeeperContext {
    pub api: Arc<dyn MetadataApi>,
    pub sandbox: Arc<dyn Sandbox>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub ports: Arc<StaticPortAllocator>,
    pub refresh_interval: Duration,
}

pub struct Keeper {
    snapshot: ContainerSnapshot,
    cache: ReconcileCache,
    ctx: KeeperContext,
    summary: watch::Sender<ContainerSummary>,
    /// Addresses the static range is currently mapped to.
    mapped: Vec<String>,
}

impl Keeper {
    pub fn new(
        snapshot: ContainerSnapshot,
        ctx: KeeperContext,
        summary: watch::Sender<ContainerSummary>,
    ) -> Self {
        Self {
            cache: ReconcileCache::new(Arc::clone(&ctx.api)),
            snapshot,
            ctx,
            summary,
            mapped: Vec::new(),
        }
    }

    /// Process events until the container is dead or the sender is gone,
    /// then withdraw everything held for it.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ContainerEvent>) {
        let id = self.snapshot.id().to_string();
        self.refresh().await;
        if let Err(e) = self.ctx.sandbox.setup_container_chain(&id).await {
            error!("error setting up chain for {}: {}", id, e);
        }

        while let Some(event) = events.recv().await {
            match event {
                ContainerEvent::NeedUpdate => self.update().await,
                ContainerEvent::Dead => break,
            }
            self.summary.send_replace(self.current_summary());
        }

        self.teardown().await;
        if let Err(e) = self.ctx.sandbox.remove_container_chain(&id).await {
            error!("error removing chain for {}: {}", id, e);
        }
        self.summary.send_replace(self.current_summary());
        info!("container {} dead", id);
    }

    fn current_summary(&self) -> ContainerSummary {
        ContainerSummary {
            registered: self.cache.is_created(),
            ..self.snapshot.summary()
        }
    }

    async fn refresh(&mut self) {
        match self.cache.refresh(&self.snapshot).await {
            Ok(()) => debug!("refreshed principal {}", self.snapshot.id()),
            Err(e) if e.is_not_found() => debug!("no principal for {} yet", self.snapshot.id()),
            Err(e) => warn!("error refreshing principal {}: {}", self.snapshot.id(), e),
        }
    }

    async fn update(&mut self) {
        if !self.cache.refreshed_within(self.ctx.refresh_interval) {
            self.refresh().await;
        }
        self.snapshot.reload(self.ctx.runtime.as_ref()).await;

        if !self.snapshot.is_running() {
            self.teardown().await;
            return;
        }
        if self.snapshot.static_range().is_none() {
            self.assign_static_range().await;
        }
        self.sync_static_mapping().await;
        // safe to repeat against an already converged principal
        if let Err(e) = self.cache.create(&self.snapshot).await {
            error!("error creating principal {}: {}", self.snapshot.id(), e);
        }
    }

    /// Give the container a static range. Without a free slot the container
    /// goes on without one.
    async fn assign_static_range(&mut self) {
        let id = self.snapshot.id().to_string();
        let range = match self.ctx.ports.acquire() {
            Ok(range) => range,
            Err(e) => {
                warn!("no static ports for {}: {}, retry later", id, e);
                return;
            }
        };
        if let Err(e) = self.ctx.sandbox.clear_static_port_mapping(&id).await {
            warn!("error clearing static mapping of {}: {}", id, e);
        }
        self.snapshot.assign_static_range(range);
        self.mapped.clear();
        info!("assigned static ports {} to {}", range, id);
    }

    /// Route the static range to the addresses the container owns now. A
    /// container that gains or changes its address is remapped.
    async fn sync_static_mapping(&mut self) {
        let Some(range) = self.snapshot.static_range() else {
            return;
        };
        let owned: Vec<String> = self
            .snapshot
            .ips()
            .iter()
            .filter(|ip| self.snapshot.owns_ip(ip))
            .cloned()
            .collect();
        if owned == self.mapped {
            return;
        }

        let id = self.snapshot.id().to_string();
        if !self.mapped.is_empty() {
            if let Err(e) = self.ctx.sandbox.clear_static_port_mapping(&id).await {
                warn!("error clearing static mapping of {}: {}", id, e);
            }
        }
        // only installed addresses count, failed ones are retried
        self.mapped.clear();
        for ip in owned {
            match self
                .ctx
                .sandbox
                .setup_static_port_mapping(&id, &ip, range.min, range.max)
                .await
            {
                Ok(()) => self.mapped.push(ip),
                Err(e) => error!("error mapping static ports of {} to {}: {}", id, ip, e),
            }
        }
    }

    /// Drop the principal and the static range. Used for stopped, vanished
    /// and dead containers alike.
    async fn teardown(&mut self) {
        if let Err(e) = self.cache.remove(&self.snapshot).await {
            error!("error removing principal {}: {}", self.snapshot.id(), e);
        }
        self.mapped.clear();
        if let Some(range) = self.snapshot.take_static_range() {
            let id = self.snapshot.id();
            if let Err(e) = self.ctx.sandbox.clear_static_port_mapping(id).await {
                error!("error clearing static mapping of {}: {}", id, e);
            }
            self.ctx.ports.release(range);
            info!("released static ports {} of {}", range, id);
        }
    }
}
