//! Common utilities and types for the Sync Orchestrator
//!
//! This crate provides the shared vocabulary used across the workspace:
//! the six cooperating domains, the state/allocation/transaction data model,
//! the message envelopes and the error taxonomy.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, ErrorReport, Result};
pub use models::*;
pub use types::*;
