//! Directory-backed record store.
//!
//! Every node record lives in its own file named after the node identifier.
//! Writes go to a sibling `<id>.tmp` file which is synced and then renamed
//! over the record, so a crash never leaves a half-written record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::storage::io::{NodeStore, StorageError};
use crate::types::NodeId;

const TEMP_SUFFIX: &str = ".tmp";

/// A record store rooted at an existing directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Open a store on an existing directory.
    ///
    /// The directory is not created; bootstrapping it is the caller's job.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let directory = directory.into();
        let metadata = fs::metadata(&directory).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("{} is not a directory", directory.display()),
            )));
        }
        Ok(Self { directory })
    }

    /// The directory holding the records.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, id: &NodeId) -> PathBuf {
        self.directory.join(id.as_str())
    }

    fn temp_path(&self, id: &NodeId) -> PathBuf {
        self.directory.join(format!("{id}{TEMP_SUFFIX}"))
    }
}

impl NodeStore for FileStore {
    async fn read_record(&self, id: &NodeId) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id.clone())),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn write_record(&self, id: &NodeId, bytes: &[u8]) -> Result<(), StorageError> {
        let temp = self.temp_path(id);
        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, self.record_path(id)).await?;
        Ok(())
    }

    async fn delete_record(&self, id: &NodeId) -> Result<(), StorageError> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id.clone())),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, id: &NodeId) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.record_path(id)).await?)
    }
}
