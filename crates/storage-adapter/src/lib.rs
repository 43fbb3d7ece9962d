//! Persistent storage for the Sync Orchestrator
//!
//! This crate provides the append-only transaction journal and the
//! allocation ledger snapshot, sufficient to drive in-flight transactions to
//! a terminal state after a restart.

pub mod journal;
pub mod manager;
pub mod snapshot;

// Re-export commonly used types
pub use journal::{
    latest_by_transaction, FileJournal, JournalRecord, MemoryJournal, PendingCompensation, TransactionJournal,
};
pub use manager::{PersistenceSettings, StorageManager};
pub use snapshot::LedgerSnapshotStore;
