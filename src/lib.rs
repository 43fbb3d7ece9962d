//! Main integration module for the Sync Orchestrator
//!
//! Loads configuration, installs logging and wires the orchestration engine.
//! Domain agents are registered by the embedding application. With the
//! `dry-run` feature, scripted agents can be registered for every domain so
//! the engine can be exercised without real hardware.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use logging::{init_logging, LoggingSettings, WorkerGuard};
use orchestrator_core::{DomainAgent, EntitySeed, MetricsSnapshot, OrchestratorEngine};
use settings::ConfigManager;

pub use orchestrator_core;

/// Main sync orchestrator
pub struct SyncOrchestrator {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Orchestration engine
    engine: OrchestratorEngine,

    /// Keeps the file log writer alive
    _log_guard: Option<WorkerGuard>,
}

impl SyncOrchestrator {
    /// Creates a new orchestrator from an optional configuration file
    ///
    /// `log_level` overrides `logging.level` when given.
    pub async fn new(config_path: Option<&Path>, log_level: Option<&str>) -> Result<Self> {
        let config_manager = Arc::new(
            ConfigManager::new(config_path).context("Failed to load configuration")?,
        );

        let mut logging_settings = LoggingSettings::from_config(&config_manager);
        if let Some(level) = log_level {
            logging_settings.level = level.to_string();
        }
        let log_guard = init_logging(&logging_settings).context("Failed to initialize logging")?;

        info!(
            config = ?config_manager.source_path(),
            "Initializing sync orchestrator"
        );

        let engine = OrchestratorEngine::new(config_manager.clone())
            .await
            .context("Failed to create orchestration engine")?;

        Ok(Self {
            config_manager,
            engine,
            _log_guard: log_guard,
        })
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn engine(&self) -> &OrchestratorEngine {
        &self.engine
    }

    /// Registers a domain agent with the entities it owns
    pub fn register_agent(&self, agent: Arc<dyn DomainAgent>, seeds: Vec<EntitySeed>) -> Result<()> {
        let domain = agent.domain();
        self.engine
            .register_agent(agent, seeds)
            .with_context(|| format!("Failed to register {} agent", domain))
    }

    /// Registers an always-succeeding scripted agent for every domain
    #[cfg(feature = "dry-run")]
    pub fn register_dry_run_agents(&self) -> Result<()> {
        use common::types::{Domain, Owner};
        use orchestrator_core::testing::ScriptedAgent;
        use serde_json::json;

        for domain in Domain::ALL {
            let seeds = vec![
                EntitySeed::new(
                    format!("{}.status", domain.as_str()),
                    Owner::Agent,
                    json!({ "state": "ready" }),
                ),
                EntitySeed::new(
                    format!("{}.capacity", domain.as_str()),
                    Owner::Controller,
                    json!({}),
                ),
            ];
            self.register_agent(Arc::new(ScriptedAgent::new(domain)), seeds)?;
        }

        info!("Registered dry-run agents for all domains");
        Ok(())
    }

    /// Starts the engine and its background loops
    pub async fn start(&self) -> Result<()> {
        self.engine.start().await.context("Failed to start engine")?;
        info!("Sync orchestrator started");
        Ok(())
    }

    /// Stops the engine, draining in-flight work and saving a snapshot
    pub async fn stop(&self) -> Result<()> {
        self.engine.stop().await.context("Failed to stop engine")?;
        info!("Sync orchestrator stopped");
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics()
    }
}
