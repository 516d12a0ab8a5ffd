//! Images known to the runtime and whether their provenance was posted.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::runtime::docker::{image_config_path, ImageConfig};
use crate::types::short_id;

#[derive(Debug)]
pub struct TrackedImage {
    /// Full content id, hex without algorithm prefix.
    id: String,
    path: PathBuf,
    config: Option<ImageConfig>,
    proven: bool,
}

impl TrackedImage {
    pub fn new(image_root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            path: image_config_path(image_root, id),
            config: None,
            proven: false,
        }
    }

    /// Principal name of the image.
    pub fn id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn is_proven(&self) -> bool {
        self.proven
    }

    pub fn mark_proven(&mut self) {
        self.proven = true;
    }

    /// Read the image config from the content store. The blob must hash to
    /// the image id.
    pub fn load(&mut self) -> Result<()> {
        let data = fs::read(&self.path)?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != self.id {
            return Err(Error::DigestMismatch {
                id: self.id.clone(),
                actual,
            });
        }
        self.config = Some(ImageConfig::parse(&self.path, &data)?);
        Ok(())
    }

    /// Provenance statement, if the image records the source it was built
    /// from.
    pub fn image_fact(&self) -> Option<String> {
        let source = self.config.as_ref()?.source.as_ref()?;
        if source.repo.is_empty() {
            return None;
        }
        Some(format!(
            "imageFact(\"{}\", \"{}\", \"{}\", \"\", \"\")",
            self.id(),
            source.repo,
            source.revision
        ))
    }

    pub fn describe(&self) -> String {
        let source = self
            .config
            .as_ref()
            .and_then(|c| c.source.as_ref())
            .map(|s| format!("{}@{}", s.repo, s.revision))
            .unwrap_or_else(|| "-".into());
        format!(
            "image {} loaded={} proven={} source={}",
            self.id(),
            self.is_loaded(),
            self.proven,
            source
        )
    }
}
