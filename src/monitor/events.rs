//! Translation of raw filesystem notifications into lifecycle events.

use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind};

use crate::runtime::docker::{is_config_file, IMAGE_REPO_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A container directory appeared; carries the directory name.
    DirectoryCreated(String),
    DirectoryRemoved(String),
    /// One of a container's state files changed.
    ContentChanged(String),
    ImageRepoChanged,
    Ignored,
}

pub struct EventTranslator {
    container_root: PathBuf,
    image_root: PathBuf,
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl EventTranslator {
    pub fn new(container_root: impl Into<PathBuf>, image_root: impl Into<PathBuf>) -> Self {
        Self {
            container_root: container_root.into(),
            image_root: image_root.into(),
        }
    }

    /// One lifecycle event per path of the notification, ignored ones
    /// dropped.
    pub fn translate(&self, event: &Event) -> Vec<FsEvent> {
        event
            .paths
            .iter()
            .map(|p| self.translate_path(&event.kind, p))
            .filter(|e| *e != FsEvent::Ignored)
            .collect()
    }

    fn translate_path(&self, kind: &EventKind, path: &Path) -> FsEvent {
        // reads and non-writing closes never change state
        match kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {}
            EventKind::Access(_) => return FsEvent::Ignored,
            _ => {}
        }

        let parent = path.parent();
        if path == self.image_root
            || (parent == Some(self.image_root.as_path())
                && file_name(path).as_deref() == Some(IMAGE_REPO_FILE))
        {
            return FsEvent::ImageRepoChanged;
        }

        if parent == Some(self.container_root.as_path()) {
            let Some(id) = file_name(path) else {
                return FsEvent::Ignored;
            };
            return match kind {
                EventKind::Create(_) => FsEvent::DirectoryCreated(id),
                EventKind::Remove(_) => FsEvent::DirectoryRemoved(id),
                _ => FsEvent::Ignored,
            };
        }

        let grandparent = parent.and_then(Path::parent);
        if grandparent == Some(self.container_root.as_path()) {
            let is_state_file = file_name(path).is_some_and(|n| is_config_file(&n));
            if let (true, Some(id)) = (is_state_file, parent.and_then(file_name)) {
                return FsEvent::ContentChanged(id);
            }
        }
        FsEvent::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

    fn translator() -> EventTranslator {
        EventTranslator::new("/var/lib/docker/containers", "/var/lib/docker/image/overlay2")
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn container_directory_lifecycle() {
        let t = translator();
        assert_eq!(
            t.translate(&event(
                EventKind::Create(CreateKind::Folder),
                "/var/lib/docker/containers/abc"
            )),
            vec![FsEvent::DirectoryCreated("abc".into())]
        );
        assert_eq!(
            t.translate(&event(
                EventKind::Remove(RemoveKind::Folder),
                "/var/lib/docker/containers/abc"
            )),
            vec![FsEvent::DirectoryRemoved("abc".into())]
        );
        assert!(t
            .translate(&event(
                EventKind::Modify(ModifyKind::Any),
                "/var/lib/docker/containers/abc"
            ))
            .is_empty());
    }

    #[test]
    fn state_file_rename_is_a_content_change() {
        let t = translator();
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            "/var/lib/docker/containers/abc/config.v2.json",
        );
        assert_eq!(
            t.translate(&renamed),
            vec![FsEvent::ContentChanged("abc".into())]
        );
        let written = event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            "/var/lib/docker/containers/abc/hostconfig.json",
        );
        assert_eq!(t.translate(&written), vec![FsEvent::ContentChanged("abc".into())]);
    }

    #[test]
    fn unrelated_paths_are_ignored() {
        let t = translator();
        for path in [
            "/var/lib/docker/containers/abc/config.v2.json.tmp",
            "/var/lib/docker/containers/abc/mounts/config.v2.json",
            "/var/lib/docker/volumes/x",
        ] {
            assert!(
                t.translate(&event(EventKind::Create(CreateKind::File), path))
                    .is_empty(),
                "{}",
                path
            );
        }
        assert!(t
            .translate(&event(
                EventKind::Access(AccessKind::Read),
                "/var/lib/docker/containers/abc/config.v2.json"
            ))
            .is_empty());
    }

    #[test]
    fn repository_index_change() {
        let t = translator();
        assert_eq!(
            t.translate(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                "/var/lib/docker/image/overlay2/repositories.json"
            )),
            vec![FsEvent::ImageRepoChanged]
        );
        assert!(t
            .translate(&event(
                EventKind::Create(CreateKind::File),
                "/var/lib/docker/image/overlay2/repositories.json.tmp"
            ))
            .is_empty());
    }

    #[test]
    fn one_event_per_path() {
        let t = translator();
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/var/lib/docker/containers/a/.tmp-config"))
            .add_path(PathBuf::from("/var/lib/docker/containers/a/config.v2.json"));
        assert_eq!(t.translate(&rename), vec![FsEvent::ContentChanged("a".into())]);
    }
}
