//! Main module for the resource manager
//!
//! This crate holds the two leaf stores of the engine: the Domain Registry
//! (authoritative, versioned, single-writer state entities) and the
//! Allocation Ledger (the single source of truth for resource capacity).

mod ledger;
mod registry;

pub use ledger::{AllocationLedger, LedgerSnapshot, PoolKey, PoolSnapshot, PoolUsage, ReserveRequest};
pub use registry::{DomainRegistry, WriteOp};

use std::sync::Arc;

use tracing::info;

use common::error::Result;
use settings::ConfigManager;

/// Builds a ledger with the capacities declared in configuration
pub fn ledger_from_config(config_manager: &ConfigManager) -> Result<Arc<AllocationLedger>> {
    let ledger = Arc::new(AllocationLedger::new());

    for (domain, kind, amount) in config_manager.get_capacities()? {
        ledger.declare_capacity(domain, kind, amount)?;
    }

    info!("Allocation ledger initialised with {} pools", ledger.pool_count());

    Ok(ledger)
}
