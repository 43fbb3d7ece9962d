//! Transaction journal
//!
//! Append-only log with one record per transaction state transition. The
//! file-backed journal writes one JSON object per line and syncs after each
//! append; a torn final line left by a crash is skipped on load.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use serde_json::Value;

use common::error::Result;
use common::models::{AllocationId, TransactionId, TransactionMode, TransactionState};
use common::types::Domain;
use resource_manager::WriteOp;

/// Compensation owed by an executed saga step
///
/// Journaled with every saga transition so a restart can finish the rollback
/// of a transaction that was interrupted mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCompensation {
    /// Step label used in reports
    pub label: String,

    /// Domain that executed the step
    pub domain: Domain,

    /// Compensating action, if the step declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Payload handed to the compensating action
    #[serde(default)]
    pub payload: Value,

    /// Allocations the step holds
    #[serde(default)]
    pub allocations: Vec<AllocationId>,
}

/// One state transition of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Caller-supplied transaction id
    pub transaction_id: TransactionId,

    /// Execution mode
    pub mode: TransactionMode,

    /// State entered
    pub state: TransactionState,

    /// Allocations held by the transaction at this point
    #[serde(default)]
    pub allocations: Vec<AllocationId>,

    /// Registry writes to apply on commit; present on the Committing record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<WriteOp>,

    /// Compensations owed by executed saga steps, in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<PendingCompensation>,

    /// Set when a compensation failed
    #[serde(default)]
    pub partial_failure: bool,

    /// Set on Committed when a participant did not confirm the commit
    #[serde(default)]
    pub degraded: bool,

    /// Failure or diagnostic detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Time of the transition
    pub recorded_at: DateTime<Utc>,
}

impl JournalRecord {
    /// Creates a record stamped now
    pub fn new(transaction_id: impl Into<TransactionId>, mode: TransactionMode, state: TransactionState) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            mode,
            state,
            allocations: Vec::new(),
            writes: Vec::new(),
            compensations: Vec::new(),
            partial_failure: false,
            degraded: false,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_allocations(mut self, allocations: Vec<AllocationId>) -> Self {
        self.allocations = allocations;
        self
    }

    pub fn with_writes(mut self, writes: Vec<WriteOp>) -> Self {
        self.writes = writes;
        self
    }

    pub fn with_compensations(mut self, compensations: Vec<PendingCompensation>) -> Self {
        self.compensations = compensations;
        self
    }

    pub fn with_partial_failure(mut self, partial_failure: bool) -> Self {
        self.partial_failure = partial_failure;
        self
    }

    pub fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Durable log of transaction state transitions
#[async_trait]
pub trait TransactionJournal: Send + Sync {
    /// Appends a record
    async fn append(&self, record: &JournalRecord) -> Result<()>;

    /// Loads every record in append order
    async fn load(&self) -> Result<Vec<JournalRecord>>;

    /// Drops the records of every transaction not in `keep`
    ///
    /// Returns the number of records removed.
    async fn compact(&self, keep: &HashSet<TransactionId>) -> Result<usize>;
}

/// Last record of each transaction, keyed by transaction id
pub fn latest_by_transaction(records: Vec<JournalRecord>) -> BTreeMap<TransactionId, JournalRecord> {
    let mut latest = BTreeMap::new();
    for record in records {
        latest.insert(record.transaction_id.clone(), record);
    }
    latest
}

/// File-backed journal, one JSON record per line
pub struct FileJournal {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileJournal {
    /// Opens (creating if needed) a journal file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        OpenOptions::new().create(true).append(true).open(&path).await?;

        info!("Transaction journal at {}", path.display());

        Ok(Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TransactionJournal for FileJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        debug!(
            transaction_id = %record.transaction_id,
            state = %record.state,
            "Journal record appended"
        );

        Ok(())
    }

    async fn load(&self) -> Result<Vec<JournalRecord>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping unreadable journal line {} in {}: {}", line_no + 1, self.path.display(), e);
                }
            }
        }

        Ok(records)
    }

    async fn compact(&self, keep: &HashSet<TransactionId>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let records = self.load().await?;
        let before = records.len();
        let kept: Vec<&JournalRecord> = records
            .iter()
            .filter(|r| keep.contains(&r.transaction_id))
            .collect();

        let mut buffer = Vec::new();
        for record in &kept {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&buffer).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;

        let removed = before - kept.len();
        debug!(removed, "Transaction journal compacted");

        Ok(removed)
    }
}

/// In-memory journal, used when persistence is disabled
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl TransactionJournal for MemoryJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<JournalRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn compact(&self, keep: &HashSet<TransactionId>) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| keep.contains(&r.transaction_id));
        Ok(before - records.len())
    }
}
