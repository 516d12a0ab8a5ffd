//! Overlay network tracking.
//!
//! Every overlay network visible on the host is a namespace this instance
//! must belong to on the metadata service.

use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::metadata::MetadataApi;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NetworkChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl NetworkChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_networks(old: &[String], new: &[String]) -> NetworkChanges {
    NetworkChanges {
        added: new.iter().filter(|n| !old.contains(n)).cloned().collect(),
        removed: old.iter().filter(|o| !new.contains(o)).cloned().collect(),
    }
}

#[derive(Default)]
pub struct NetworkTracker {
    current: Mutex<Vec<String>>,
}

impl NetworkTracker {
    pub async fn current(&self) -> Vec<String> {
        self.current.lock().await.clone()
    }

    /// Re-list overlay networks and record the new set. A failed listing
    /// changes nothing.
    pub async fn changes(&self, runtime: &dyn ContainerRuntime) -> NetworkChanges {
        let mut current = self.current.lock().await;
        let listed = match runtime.overlay_networks().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!("cannot list overlay networks: {}", e);
                return NetworkChanges::default();
            }
        };
        let changes = diff_networks(&current, &listed);
        *current = listed;
        changes
    }

    /// Join new networks' namespaces and leave vanished ones.
    pub async fn sync(&self, runtime: &dyn ContainerRuntime, api: &dyn MetadataApi) {
        let changes = self.changes(runtime).await;
        if changes.is_empty() {
            return;
        }
        info!(
            "networks added: {:?}, removed: {:?}",
            changes.added, changes.removed
        );
        for ns in &changes.added {
            if let Err(e) = api.create_ns(ns).await {
                // likely created by another instance
                warn!("failed to create ns {}: {}", ns, e);
            }
            if let Err(e) = api.join_ns(ns).await {
                error!("failed to join ns {}: {}", ns, e);
            }
        }
        for ns in &changes.removed {
            if let Err(e) = api.leave_ns(ns).await {
                error!("failed to leave ns {}: {}", ns, e);
            }
            if let Err(e) = api.delete_ns(ns).await {
                warn!("failed to delete ns {}: {}", ns, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::stub::StubMetadataApi;
    use crate::runtime::stub::StubRuntime;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_both_ways() {
        let changes = diff_networks(&names(&["a", "b"]), &names(&["b", "c"]));
        assert_eq!(changes.added, names(&["c"]));
        assert_eq!(changes.removed, names(&["a"]));
        assert!(diff_networks(&names(&["a"]), &names(&["a"])).is_empty());
    }

    #[tokio::test]
    async fn joins_and_leaves_namespaces() {
        let runtime = StubRuntime::default();
        let api = StubMetadataApi::empty();
        let tracker = NetworkTracker::default();

        runtime.set_networks(&["n1", "n2"]);
        tracker.sync(&runtime, &api).await;
        assert_eq!(api.namespaces().len(), 2);
        assert_eq!(api.calls("create_ns"), 2);

        runtime.set_networks(&["n2", "n3"]);
        tracker.sync(&runtime, &api).await;
        assert!(api.namespaces().contains("n3"));
        assert!(!api.namespaces().contains("n1"));
        assert_eq!(api.call_args("delete_ns"), names(&["n1"]));
        assert_eq!(tracker.current().await, names(&["n2", "n3"]));
    }

    #[tokio::test]
    async fn failed_listing_is_no_change() {
        let runtime = StubRuntime::default();
        let api = StubMetadataApi::empty();
        let tracker = NetworkTracker::default();
        runtime.set_networks(&["n1"]);
        tracker.sync(&runtime, &api).await;

        runtime.break_networks();
        tracker.sync(&runtime, &api).await;
        assert_eq!(api.calls("leave_ns"), 0);
        assert_eq!(tracker.current().await, names(&["n1"]));
    }

    #[tokio::test]
    async fn create_failure_still_joins() {
        let runtime = StubRuntime::default();
        let api = StubMetadataApi::empty();
        api.fail_on("create_ns");
        runtime.set_networks(&["n1"]);
        NetworkTracker::default().sync(&runtime, &api).await;
        assert!(api.namespaces().contains("n1"));
    }
}
