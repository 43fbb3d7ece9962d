//! Allocation ledger snapshot persistence

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use common::error::Result;
use resource_manager::LedgerSnapshot;

/// Stores the latest ledger snapshot in a single JSON file
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a reader never sees a partial snapshot.
#[derive(Debug, Clone)]
pub struct LedgerSnapshotStore {
    path: PathBuf,
}

impl LedgerSnapshotStore {
    /// Creates a store writing to `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists a snapshot
    pub async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;

        debug!(
            allocations = snapshot.allocations.len(),
            path = %self.path.display(),
            "Ledger snapshot saved"
        );

        Ok(())
    }

    /// Loads the last saved snapshot, if any
    pub async fn load(&self) -> Result<Option<LedgerSnapshot>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{Domain, ResourceKind};
    use resource_manager::{AllocationLedger, ReserveRequest};

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerSnapshotStore::open(dir.path().join("ledger.json")).await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        let ledger = AllocationLedger::new();
        ledger.declare_capacity(Domain::Model, ResourceKind::ModelSlot, 4).unwrap();
        let id = ledger
            .reserve(ReserveRequest::new(Domain::Model, ResourceKind::ModelSlot, 2).with_owner("tx-9"))
            .unwrap();

        store.save(&ledger.snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();

        assert_eq!(loaded.pools.len(), 1);
        assert_eq!(loaded.allocations.len(), 1);
        assert_eq!(loaded.allocations[0].id, id);
        assert_eq!(loaded.allocations[0].owner_transaction.as_deref(), Some("tx-9"));
    }
}
