//! The dispatcher: container and image tables, rescans and the event loop.
//!
//! The monitor never talks to the metadata service on behalf of a
//! container. It only routes events to the container's keeper, which owns
//! all of that container's state. The tables are guarded by separate locks
//! that are never held across a remote call.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::container::{ContainerSnapshot, ContainerSummary};
use crate::error::{Error, Result};
use crate::image::TrackedImage;
use crate::metadata::MetadataApi;
use crate::ports::StaticPortAllocator;
use crate::runtime::docker::Repositories;
use crate::runtime::ContainerRuntime;
use crate::sandbox::Sandbox;
use crate::types::{short_id, ContainerEvent, InstanceIp, DEFAULT_NS};
use crate::watch::{PathWatch, RawEvents};

pub mod events;
pub mod keeper;
pub mod network;

use events::{EventTranslator, FsEvent};
use keeper::{Keeper, KeeperContext};
use network::NetworkTracker;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The monitor's side of one keeper.
struct ContainerHandle {
    events: mpsc::UnboundedSender<ContainerEvent>,
    summary: watch::Receiver<ContainerSummary>,
}

impl ContainerHandle {
    fn notify(&self, id: &str, event: ContainerEvent) {
        if self.events.send(event).is_err() {
            debug!("keeper of {} already gone, dropping {:?}", id, event);
        }
    }
}

pub struct Monitor {
    container_root: PathBuf,
    image_root: PathBuf,
    rescan_interval: Duration,
    host_network: String,
    instance_ips: Vec<InstanceIp>,
    ctx: KeeperContext,
    watcher: Arc<dyn PathWatch>,
    containers: Mutex<HashMap<String, ContainerHandle>>,
    images: Mutex<HashMap<String, TrackedImage>>,
    /// Serializes image scans without blocking readers of the image table.
    image_scan: Mutex<()>,
    networks: NetworkTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn instance_ip(what: &str, ip: Result<String>) -> Result<String> {
    let ip = ip?;
    ip.parse::<IpAddr>()
        .map_err(|_| Error::Metadata(format!("invalid {} ip {:?}", what, ip)))?;
    Ok(ip)
}

impl Monitor {
    /// Resolve this instance's identity and start watching the runtime's
    /// roots. Any failure here is fatal.
    pub async fn new(
        config: &Config,
        api: Arc<dyn MetadataApi>,
        sandbox: Arc<dyn Sandbox>,
        runtime: Arc<dyn ContainerRuntime>,
        watcher: Arc<dyn PathWatch>,
    ) -> Result<Self> {
        let public_ip = instance_ip("public", api.my_public_ip().await)?;
        let local_ip = instance_ip("local", api.my_local_ip().await)?;
        let local_ns = api.my_ns().await?;
        info!(
            "instance identity: public {}, local {} in {}",
            public_ip, local_ip, local_ns
        );

        let container_root = config.container_root();
        let image_root = config.image_root();
        watcher.watch(&container_root)?;
        watcher.watch(&image_root)?;

        let ports = StaticPortAllocator::new(
            config.static_port_base,
            config.static_port_max,
            config.ports_per_container,
        );
        ports.reset_all();

        Ok(Self {
            container_root,
            image_root,
            rescan_interval: config.rescan_interval(),
            host_network: config.docker_host_network.clone(),
            instance_ips: vec![
                InstanceIp::new(local_ns, local_ip),
                InstanceIp::new(DEFAULT_NS, public_ip),
            ],
            ctx: KeeperContext {
                api,
                sandbox,
                runtime,
                ports: Arc::new(ports),
                refresh_interval: config.refresh_interval(),
            },
            watcher,
            containers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            image_scan: Mutex::new(()),
            networks: NetworkTracker::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Start a keeper for the container directory `dir` and queue its first
    /// update. The caller holds the container table.
    async fn track(&self, table: &mut HashMap<String, ContainerHandle>, dir: &str) {
        let root = self.container_root.join(dir);
        let snapshot = ContainerSnapshot::new(
            dir,
            &root,
            self.instance_ips.clone(),
            self.host_network.clone(),
        );
        let id = snapshot.id().to_string();
        if let Err(e) = self.watcher.watch(&root) {
            warn!("cannot watch {}: {}", root.display(), e);
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (summary_tx, summary) = watch::channel(snapshot.summary());
        let keeper = Keeper::new(snapshot, self.ctx.clone(), summary_tx);
        let worker = tokio::spawn(keeper.run(rx));
        {
            let mut workers = self.workers.lock().await;
            workers.retain(|w| !w.is_finished());
            workers.push(worker);
        }

        let handle = ContainerHandle { events, summary };
        handle.notify(&id, ContainerEvent::NeedUpdate);
        table.insert(id.clone(), handle);
        info!("tracking container {}", id);
    }

    /// Forward an update to the container's keeper, starting one if the
    /// directory was never seen.
    async fn update_container(&self, dir: &str) {
        let mut table = self.containers.lock().await;
        match table.get(short_id(dir)) {
            Some(handle) => handle.notify(short_id(dir), ContainerEvent::NeedUpdate),
            None => self.track(&mut table, dir).await,
        }
    }

    async fn remove_container(&self, dir: &str) {
        let id = short_id(dir);
        if let Some(handle) = self.containers.lock().await.remove(id) {
            info!("container {} removed", id);
            handle.notify(id, ContainerEvent::Dead);
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: FsEvent) {
        debug!("fs event {:?}", event);
        match event {
            FsEvent::DirectoryCreated(dir) => {
                if self.container_root.join(&dir).is_dir() {
                    self.update_container(&dir).await
                } else {
                    warn!("non-directory {} in container root", dir);
                }
            }
            FsEvent::ContentChanged(dir) => self.update_container(&dir).await,
            FsEvent::DirectoryRemoved(dir) => self.remove_container(&dir).await,
            FsEvent::ImageRepoChanged => {
                let monitor = Arc::clone(self);
                tokio::spawn(async move { monitor.scan_images().await });
            }
            FsEvent::Ignored => {}
        }
    }

    /// Load newly listed images and post provenance for those not proven
    /// yet. Failures leave the image to the next scan.
    ///
    /// Images stay in the table while their proof is posted so a concurrent
    /// rescan never takes their principals for stale ones.
    pub async fn scan_images(&self) {
        let _scan = self.image_scan.lock().await;
        let repos = match Repositories::load(&self.image_root) {
            Ok(repos) => repos,
            Err(e) => {
                warn!("cannot load image repositories: {}", e);
                return;
            }
        };
        let listed = repos.image_ids();

        let mut unproven = Vec::new();
        {
            let mut images = self.images.lock().await;
            images.retain(|id, _| listed.contains(id));
            for id in &listed {
                let image = images
                    .entry(id.clone())
                    .or_insert_with(|| TrackedImage::new(&self.image_root, id));
                if !image.is_loaded() {
                    if let Err(e) = image.load() {
                        warn!("error loading image {}: {}", id, e);
                    }
                }
                if !image.is_proven() {
                    if let Some(fact) = image.image_fact() {
                        unproven.push((id.clone(), image.id().to_string(), fact));
                    }
                }
            }
        }

        for (id, principal, fact) in unproven {
            if let Err(e) = self.ctx.api.post_proof(&principal, &[fact]).await {
                error!("cannot post proof for image {}: {}", principal, e);
                continue;
            }
            info!("posted provenance of image {}", principal);
            if let Some(image) = self.images.lock().await.get_mut(&id) {
                image.mark_proven();
            }
        }
    }

    /// Sync the container table with the container root, then delete remote
    /// principals nothing local accounts for.
    async fn reload_containers(&self) -> Result<()> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.container_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                dirs.push(name);
            } else {
                warn!("non-directory {} in container root", name);
            }
        }
        let remote = match self.ctx.api.list_principals().await {
            Ok(remote) => Some(remote),
            Err(e) => {
                warn!("cannot list principals, skipping cleanup: {}", e);
                None
            }
        };

        let mut table = self.containers.lock().await;
        let mut live = HashSet::new();
        for dir in &dirs {
            live.insert(short_id(dir).to_string());
            match table.get(short_id(dir)) {
                Some(handle) => handle.notify(short_id(dir), ContainerEvent::NeedUpdate),
                None => self.track(&mut table, dir).await,
            }
        }
        table.retain(|id, handle| {
            let keep = live.contains(id);
            if !keep {
                info!("container {} gone", id);
                handle.notify(id, ContainerEvent::Dead);
            }
            keep
        });
        let tracked: HashSet<String> = table.keys().cloned().collect();
        drop(table);

        let images: HashSet<String> = self
            .images
            .lock()
            .await
            .values()
            .map(|i| i.id().to_string())
            .collect();
        for principal in remote.into_iter().flatten() {
            if tracked.contains(&principal) || images.contains(&principal) {
                continue;
            }
            info!("deleting stale principal {}", principal);
            if let Err(e) = self.ctx.api.delete_principal(&principal).await {
                error!("cannot delete stale principal {}: {}", principal, e);
            }
        }
        Ok(())
    }

    /// Full rescan: images, overlay networks, containers. Only an unreadable
    /// container root is an error.
    pub async fn scan(&self) -> Result<()> {
        info!("rescanning");
        self.scan_images().await;
        self.networks
            .sync(self.ctx.runtime.as_ref(), self.ctx.api.as_ref())
            .await;
        self.reload_containers().await
    }

    pub async fn dump(&self) {
        info!("current networks: {:?}", self.networks.current().await);
        info!("container path {}", self.container_root.display());
        info!("image path {}", self.image_root.display());
        info!("rescan every {:?}", self.rescan_interval);
        info!(
            "static ports: {} slots, allocated {:?}",
            self.ctx.ports.capacity(),
            self.ctx
                .ports
                .allocated()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
        info!("instance ips: {:?}", self.instance_ips);

        info!("**** containers");
        for (id, handle) in self.containers.lock().await.iter() {
            let s = handle.summary.borrow();
            info!(
                "{} root={} loaded={} running={} registered={} ips={:?} static={}",
                id,
                s.root.display(),
                s.loaded,
                s.running,
                s.registered,
                s.ips,
                s.static_range
                    .map_or_else(|| "-".to_string(), |r| r.to_string())
            );
        }
        info!("**** images");
        for image in self.images.lock().await.values() {
            info!("{}", image.describe());
        }
    }

    /// Signal every keeper dead and wait for them to clean up.
    pub async fn shutdown(&self) {
        for (id, handle) in self.containers.lock().await.drain() {
            handle.notify(&id, ContainerEvent::Dead);
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        info!("waiting for {} keepers", workers.len());
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(workers))
            .await
            .is_err()
        {
            warn!("keepers did not finish within {:?}", SHUTDOWN_GRACE);
        }
    }

    /// Initial scan, then dispatch until SIGINT or SIGTERM.
    pub async fn run(self: Arc<Self>, mut events: RawEvents) -> Result<()> {
        self.scan().await?;

        let translator = EventTranslator::new(self.container_root.clone(), self.image_root.clone());
        let mut rescan = tokio::time::interval_at(
            tokio::time::Instant::now() + self.rescan_interval,
            self.rescan_interval,
        );
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                Some(raw) = events.recv() => match raw {
                    Ok(event) => {
                        for event in translator.translate(&event) {
                            self.handle_event(event).await;
                        }
                    }
                    Err(e) => error!("watch error: {}", e),
                },
                _ = rescan.tick() => {
                    let monitor = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = monitor.scan().await {
                            error!("rescan failed: {}", e);
                        }
                    });
                }
                _ = usr1.recv() => self.dump().await,
                _ = usr2.recv() => self.dump().await,
                _ = interrupt.recv() => {
                    info!("interrupted, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    info!("terminated, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}
