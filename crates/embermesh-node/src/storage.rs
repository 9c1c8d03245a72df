//! File-backed block storage
//!
//! One file per block under a data directory. Writes go through a temp file
//! and rename so a crash mid-write leaves the previous block intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use embermesh_engine::storage::{BlockId, BlockStorage, StorageError};
use tracing::debug;

/// Block storage over a plain directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<FileStorage> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(FileStorage { dir })
    }

    fn path(&self, block: BlockId) -> PathBuf {
        let name = match block {
            BlockId::Config => "config.blk",
            BlockId::Stats => "stats.blk",
            BlockId::Mailbox => "mailbox.blk",
        };
        self.dir.join(name)
    }
}

#[async_trait]
impl BlockStorage for FileStorage {
    async fn read_block(&mut self, block: BlockId) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path(block)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(block);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        debug!(?block, len = data.len(), "block written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_missing_block() {
        let dir = std::env::temp_dir().join(format!("embermesh-test-{}", std::process::id()));
        let mut storage = FileStorage::open(&dir).await.unwrap();
        assert!(storage.read_block(BlockId::Stats).await.unwrap().is_none());
        storage.write_block(BlockId::Stats, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            storage.read_block(BlockId::Stats).await.unwrap().unwrap(),
            vec![1, 2, 3]
        );
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
