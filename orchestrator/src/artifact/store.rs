use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::artifact::archive::{has_entries, unzip_archive, zip_directory};
use crate::artifact::error::ArtifactError;
use crate::artifact::zip_index::{ZipIndex, ZipIndexEntry};
use crate::artifact::Artifact;
use crate::core::client::storage::StorageClient;

/// Result of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Local content already existed and was kept; nothing was downloaded
    Skipped,
    /// The remote object was downloaded (and unpacked, for archives)
    Pulled,
}

/// Maps `(partition, name)` artifacts to zip archives in the object store.
///
/// The store does no locking. Concurrent pushes of the same artifact are a caller error; the
/// pipeline's stage ordering is what keeps every artifact single-writer.
#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<dyn StorageClient>,
    workspace: PathBuf,
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn StorageClient>, workspace: impl Into<PathBuf>) -> Self {
        Self { storage, workspace: workspace.into() }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    pub fn local_path(&self, artifact: &Artifact) -> PathBuf {
        artifact.local_path(&self.workspace)
    }

    /// Archive `local_path` and upload it under the artifact's key. With `create_index` the
    /// member offset index is uploaded next to it.
    pub async fn push(&self, local_path: &Path, artifact: &Artifact, create_index: bool) -> Result<(), ArtifactError> {
        let dir = local_path.to_path_buf();
        let (archive, index) = tokio::task::spawn_blocking(move || -> Result<_, ArtifactError> {
            let archive = zip_directory(&dir)?;
            let index = if create_index { Some(ZipIndex::from_archive(&archive)?.to_bytes()?) } else { None };
            Ok((archive, index))
        })
        .await
        .map_err(|e| ArtifactError::TaskFailed(e.to_string()))??;

        let size = archive.len();
        self.storage.put_data(Bytes::from(archive), &artifact.key()).await?;
        if let Some(index) = index {
            self.storage.put_data(Bytes::from(index), &artifact.index_key()).await?;
        }

        info!(artifact = %artifact, size = size, indexed = create_index, "Pushed artifact");
        Ok(())
    }

    /// Download the artifact and unpack it into `local_path`.
    ///
    /// Without `replace_existing`, a `local_path` that already has content is left untouched and
    /// nothing is downloaded. Unpacking goes through a sibling staging directory, so a failed pull
    /// never leaves partial content at `local_path`.
    pub async fn pull(
        &self,
        local_path: &Path,
        artifact: &Artifact,
        replace_existing: bool,
    ) -> Result<PullOutcome, ArtifactError> {
        if !replace_existing && has_entries(local_path)? {
            debug!(artifact = %artifact, path = %local_path.display(), "Local artifact exists, skipping pull");
            return Ok(PullOutcome::Skipped);
        }

        let archive = self.storage.get_data(&artifact.key()).await?;
        let target = local_path.to_path_buf();
        let members = tokio::task::spawn_blocking(move || -> Result<usize, ArtifactError> {
            let staging = staging_path(&target);
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            let members = unzip_archive(&archive, &staging)?;
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            std::fs::rename(&staging, &target)?;
            Ok(members)
        })
        .await
        .map_err(|e| ArtifactError::TaskFailed(e.to_string()))??;

        info!(artifact = %artifact, path = %local_path.display(), members = members, "Pulled artifact");
        Ok(PullOutcome::Pulled)
    }

    /// Local-only check: true when the artifact is materialized in this workspace.
    /// Remote-only artifacts must be pulled (or checked with [`ArtifactStore::exists_remote`]).
    pub fn exists(&self, artifact: &Artifact) -> bool {
        self.local_path(artifact).exists()
    }

    pub async fn exists_remote(&self, artifact: &Artifact) -> Result<bool, ArtifactError> {
        Ok(self.storage.head(&artifact.key()).await?.is_some())
    }

    pub async fn load_index(&self, artifact: &Artifact) -> Result<ZipIndex, ArtifactError> {
        let data = self.storage.get_data(&artifact.index_key()).await?;
        Ok(ZipIndex::parse(&data)?)
    }

    /// Read one member of an indexed artifact: the index, then a single ranged read of the
    /// member's compressed payload. Never downloads the archive.
    pub async fn extract_file(&self, artifact: &Artifact, member: &str) -> Result<Bytes, ArtifactError> {
        let index = self.load_index(artifact).await?;
        let entry = index.find(member)?;
        self.extract_entry(artifact, entry).await
    }

    /// Like [`ArtifactStore::extract_file`] with an already loaded index entry
    pub async fn extract_entry(&self, artifact: &Artifact, entry: &ZipIndexEntry) -> Result<Bytes, ArtifactError> {
        let Some(range) = entry.range()? else {
            return Ok(Bytes::new());
        };

        let payload = self.storage.get_range(&artifact.key(), range).await?;
        let entry = entry.clone();
        let content = tokio::task::spawn_blocking(move || entry.decompress(&payload))
            .await
            .map_err(|e| ArtifactError::TaskFailed(e.to_string()))??;

        debug!(artifact = %artifact, range = %range, size = content.len(), "Extracted member");
        Ok(Bytes::from(content))
    }

    /// Upload a single file as-is under `key`.
    pub async fn push_file(
        &self,
        path: &Path,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), ArtifactError> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let size = data.len();
        if metadata.is_empty() {
            self.storage.put_data(data, key).await?;
        } else {
            self.storage.put_data_with_metadata(data, key, metadata).await?;
        }
        info!(key = %key, size = size, "Pushed file");
        Ok(())
    }

    /// Download the object under `key` into `path`. An existing file is kept unless
    /// `replace_existing` is set.
    pub async fn pull_file(&self, path: &Path, key: &str, replace_existing: bool) -> Result<PullOutcome, ArtifactError> {
        if !replace_existing && tokio::fs::try_exists(path).await? {
            debug!(key = %key, path = %path.display(), "Local file exists, skipping pull");
            return Ok(PullOutcome::Skipped);
        }

        let data = self.storage.get_data(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(path);
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, path).await?;

        info!(key = %key, path = %path.display(), size = data.len(), "Pulled file");
        Ok(PullOutcome::Pulled)
    }
}

/// Hidden sibling of `path` used while a download is in flight
fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}
