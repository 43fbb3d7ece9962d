//! Configuration management for the Sync Orchestrator
//!
//! This crate provides layered configuration: built-in defaults, an optional
//! configuration file, then environment variables prefixed `SYNC_ORCH__`.

pub mod defaults;
pub mod manager;

// Re-export commonly used types
pub use defaults::DefaultConfig;
pub use manager::ConfigManager;
