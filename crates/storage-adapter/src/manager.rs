//! Storage manager
//!
//! Chooses between durable and in-memory persistence from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use common::error::Result;
use settings::ConfigManager;

use crate::journal::{FileJournal, MemoryJournal, TransactionJournal};
use crate::snapshot::LedgerSnapshotStore;

/// Journal file name inside the persistence directory
const JOURNAL_FILE: &str = "transactions.jsonl";

/// Snapshot file name inside the persistence directory
const SNAPSHOT_FILE: &str = "ledger.json";

/// Persistence settings
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    /// Whether state survives a restart
    pub enabled: bool,

    /// Directory holding the journal and the snapshot
    pub directory: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("./state"),
        }
    }
}

impl PersistenceSettings {
    /// Reads the `persistence.*` keys
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            enabled: config_manager
                .get_bool("persistence.enabled")
                .unwrap_or(defaults.enabled),
            directory: config_manager
                .get_string("persistence.directory")
                .map(PathBuf::from)
                .unwrap_or(defaults.directory),
        }
    }
}

/// Storage manager
pub struct StorageManager {
    journal: Arc<dyn TransactionJournal>,
    snapshots: Option<LedgerSnapshotStore>,
}

impl StorageManager {
    /// Opens storage according to the settings
    pub async fn open(settings: &PersistenceSettings) -> Result<Self> {
        if !settings.enabled {
            info!("Persistence disabled, using in-memory transaction journal");
            return Ok(Self::in_memory());
        }

        let journal = FileJournal::open(settings.directory.join(JOURNAL_FILE)).await?;
        let snapshots = LedgerSnapshotStore::open(settings.directory.join(SNAPSHOT_FILE)).await?;

        info!("Persistence enabled in {}", settings.directory.display());

        Ok(Self {
            journal: Arc::new(journal),
            snapshots: Some(snapshots),
        })
    }

    /// Storage that does not survive the process
    pub fn in_memory() -> Self {
        Self {
            journal: Arc::new(MemoryJournal::new()),
            snapshots: None,
        }
    }

    /// Transaction journal
    pub fn journal(&self) -> Arc<dyn TransactionJournal> {
        Arc::clone(&self.journal)
    }

    /// Ledger snapshot store, when persistence is enabled
    pub fn snapshots(&self) -> Option<&LedgerSnapshotStore> {
        self.snapshots.as_ref()
    }

    /// Returns true if state survives a restart
    pub fn is_durable(&self) -> bool {
        self.snapshots.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalRecord;
    use common::models::{TransactionMode, TransactionState};

    #[tokio::test]
    async fn test_disabled_persistence_is_in_memory() {
        let manager = ConfigManager::defaults().unwrap();
        let storage = StorageManager::open(&PersistenceSettings::from_config(&manager))
            .await
            .unwrap();
        assert!(!storage.is_durable());
        assert!(storage.snapshots().is_none());
    }

    #[tokio::test]
    async fn test_enabled_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PersistenceSettings {
            enabled: true,
            directory: dir.path().to_path_buf(),
        };

        let storage = StorageManager::open(&settings).await.unwrap();
        storage
            .journal()
            .append(&JournalRecord::new("tx-1", TransactionMode::TwoPhase, TransactionState::Preparing))
            .await
            .unwrap();
        drop(storage);

        let reopened = StorageManager::open(&settings).await.unwrap();
        assert!(reopened.is_durable());
        assert_eq!(reopened.journal().load().await.unwrap().len(), 1);
    }
}
