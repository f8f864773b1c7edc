//! Artifact storage.
//!
//! Evaluations leave plot images and widget documents in a per-call scratch
//! directory. The evaluator reads each one and hands its contents to an
//! [`ArtifactStore`], which decides where it lives and what reference the
//! caller gets back.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Widget,
}

impl ArtifactKind {
    /// Storage category (sub-folder) for this kind.
    pub fn category(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "plots",
            ArtifactKind::Widget => "widgets",
        }
    }
}

/// Where a stored artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Reference returned to callers, e.g. `plots/plot_a1_1.jpg`.
    pub reference: String,
    /// Absolute location on disk.
    pub path: PathBuf,
}

/// Destination for evaluation artifacts.
///
/// Implementations must be safe to share between concurrent evaluations.
pub trait ArtifactStore: Send + Sync {
    /// Persist `contents` under `file_name` in the category for `kind`,
    /// replacing any existing artifact with the same name.
    fn store(
        &self,
        kind: ArtifactKind,
        file_name: &str,
        contents: &[u8],
    ) -> Result<StoredArtifact, SessionError>;
}

/// Stores artifacts under `<root>/<category>/<file_name>`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStore { root: root.into() }
    }
}

/// Reject names that would escape the category folder.
fn plain_file_name(file_name: &str) -> Option<&str> {
    let name = Path::new(file_name).file_name()?.to_str()?;
    (name == file_name).then_some(name)
}

impl ArtifactStore for DirectoryStore {
    fn store(
        &self,
        kind: ArtifactKind,
        file_name: &str,
        contents: &[u8],
    ) -> Result<StoredArtifact, SessionError> {
        let dir = self.root.join(kind.category());
        let Some(name) = plain_file_name(file_name) else {
            return Err(SessionError::ArtifactIo {
                path: dir.join(file_name),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "artifact name must be a plain file name",
                ),
            });
        };

        std::fs::create_dir_all(&dir).map_err(|source| SessionError::ArtifactIo {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(name);
        std::fs::write(&path, contents).map_err(|source| SessionError::ArtifactIo {
            path: path.clone(),
            source,
        })?;
        debug!("Stored {} bytes at {}", contents.len(), path.display());

        Ok(StoredArtifact {
            reference: format!("{}/{}", kind.category(), name),
            path,
        })
    }
}
