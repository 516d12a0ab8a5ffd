//! provd: keeps the metadata service's view of this host's containers in
//! step with the container runtime's on-disk state.

use std::sync::Arc;

use log::info;

mod config;
mod container;
mod diff;
mod error;
mod image;
mod metadata;
mod monitor;
mod ports;
mod reconcile;
mod runtime;
mod sandbox;
mod types;
mod watch;

use config::Config;
use metadata::HttpMetadataApi;
use monitor::Monitor;
use runtime::DockerRuntime;
use sandbox::IptablesSandbox;
use watch::FsWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!("Starting provd with config: {:?}", cfg);

    let api = HttpMetadataApi::new(cfg.metadata_addr.clone(), cfg.metadata_timeout())?;
    let runtime = DockerRuntime::connect(cfg.ipshow_command.clone())?;
    let (watcher, events) = FsWatcher::new()?;

    let monitor = Monitor::new(
        &cfg,
        Arc::new(api),
        Arc::new(IptablesSandbox::new()),
        Arc::new(runtime),
        Arc::new(watcher),
    )
    .await?;
    Arc::new(monitor).run(events).await?;

    info!("Shutdown complete.");
    Ok(())
}
