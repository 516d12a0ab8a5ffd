//! Filesystem change notifications.
//!
//! The monitor registers directories through [`PathWatch`] and consumes raw
//! `notify` events from the channel handed out with the watcher.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub type RawEvents = mpsc::Receiver<notify::Result<notify::Event>>;

const EVENT_QUEUE: usize = 256;

pub trait PathWatch: Send + Sync {
    /// Start delivering events for the entries of directory `path`.
    fn watch(&self, path: &Path) -> Result<()>;
}

pub struct FsWatcher {
    inner: Mutex<RecommendedWatcher>,
}

impl FsWatcher {
    pub fn new() -> Result<(Self, RawEvents)> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let watcher = RecommendedWatcher::new(
            move |res| {
                // runs on the backend's own thread
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;
        Ok((
            Self {
                inner: Mutex::new(watcher),
            },
            rx,
        ))
    }
}

impl PathWatch for FsWatcher {
    fn watch(&self, path: &Path) -> Result<()> {
        let mut watcher = self
            .inner
            .lock()
            .map_err(|_| Error::Runtime("watcher lock poisoned".into()))?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        debug!("watching {}", path.display());
        Ok(())
    }
}
