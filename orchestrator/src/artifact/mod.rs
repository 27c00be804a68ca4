pub mod archive;
pub mod error;
pub mod store;
pub mod zip_index;

use std::fmt;
use std::path::{Path, PathBuf};

pub use error::{ArtifactError, ZipIndexError};
pub use store::{ArtifactStore, PullOutcome};
pub use zip_index::{ZipIndex, ZipIndexEntry};

pub const ARCHIVE_EXTENSION: &str = "zip";
pub const INDEX_SUFFIX: &str = ".index";

/// A named, directory-shaped output of one stage for one partition.
/// Treated as immutable once pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub partition_id: String,
    pub name: String,
}

impl Artifact {
    pub fn new(partition_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { partition_id: partition_id.into(), name: name.into() }
    }

    /// Remote key of the archive: `<partition>/<name>.zip`
    pub fn key(&self) -> String {
        format!("{}/{}.{}", self.partition_id, self.name, ARCHIVE_EXTENSION)
    }

    /// Remote key of the sidecar index: `<partition>/<name>.zip.index`
    pub fn index_key(&self) -> String {
        format!("{}{}", self.key(), INDEX_SUFFIX)
    }

    /// Local materialization: `<workspace>/<partition>/<name>`
    pub fn local_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.partition_id).join(&self.name)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_id, self.name)
    }
}
