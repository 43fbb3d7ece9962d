//! Domain registry implementation
//!
//! Authoritative store of state entities. Every entity belongs to exactly one
//! domain and has exactly one writing side; all reads hand out versioned
//! snapshots, never live references. Writes are optimistic: the caller
//! presents the version it last observed and a stale version fails closed.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{EntityKey, StateEntity, Versioned};
use common::types::{Domain, Owner};

/// One entry of an all-or-nothing batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    /// Target entity
    pub entity: EntityKey,

    /// New value
    pub value: Value,

    /// Version the writer last observed
    pub expected_version: u64,

    /// Side performing the write
    pub writer: Owner,
}

/// Domain registry of versioned state entities
pub struct DomainRegistry {
    /// Entities by domain and key
    entities: DashMap<EntityKey, StateEntity>,

    /// Single writes hold this shared; batch writes hold it exclusively so a
    /// batch is validated and applied without interleaving
    commit_gate: RwLock<()>,
}

impl DomainRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            commit_gate: RwLock::new(()),
        }
    }

    /// Registers a new entity at version 1
    pub fn register(&self, domain: Domain, key: &str, owner: Owner, value: Value) -> Result<u64> {
        let entity_key = EntityKey::new(domain, key);

        match self.entities.entry(entity_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::AlreadyExists(format!("State entity {} already registered", entity_key)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StateEntity {
                    domain,
                    key: key.to_string(),
                    owner,
                    value,
                    version: 1,
                    last_updated: Utc::now(),
                });
                debug!(entity = %entity_key, %owner, "Registered state entity");
                Ok(1)
            }
        }
    }

    /// Reads a versioned snapshot of an entity
    pub fn read(&self, domain: Domain, key: &str) -> Result<Versioned> {
        self.read_entity(&EntityKey::new(domain, key))
    }

    /// Reads a versioned snapshot by entity key
    pub fn read_entity(&self, entity: &EntityKey) -> Result<Versioned> {
        self.entities
            .get(entity)
            .map(|e| Versioned {
                value: e.value.clone(),
                version: e.version,
                last_updated: e.last_updated,
            })
            .ok_or_else(|| Error::NotFound(format!("State entity {}", entity)))
    }

    /// Reads a snapshot, failing if the entity has not been written within
    /// the staleness bound
    pub fn read_fresh(&self, domain: Domain, key: &str, max_staleness: Duration) -> Result<Versioned> {
        let snapshot = self.read(domain, key)?;
        if snapshot.is_stale(max_staleness) {
            return Err(Error::InvalidState(format!(
                "State entity {}/{} is stale (last updated {})",
                domain, key, snapshot.last_updated
            )));
        }
        Ok(snapshot)
    }

    /// Owner of an entity
    pub fn owner(&self, entity: &EntityKey) -> Result<Owner> {
        self.entities
            .get(entity)
            .map(|e| e.owner)
            .ok_or_else(|| Error::NotFound(format!("State entity {}", entity)))
    }

    /// Writes an entity if the writer owns it and presents the current version
    ///
    /// Returns the new version.
    pub fn write(
        &self,
        domain: Domain,
        key: &str,
        value: Value,
        expected_version: u64,
        writer: Owner,
    ) -> Result<u64> {
        let _gate = self.commit_gate.read();
        let entity_key = EntityKey::new(domain, key);

        let mut entity = self
            .entities
            .get_mut(&entity_key)
            .ok_or_else(|| Error::NotFound(format!("State entity {}", entity_key)))?;

        Self::check_write(&entity, &entity_key, expected_version, writer)?;

        entity.value = value;
        entity.version += 1;
        entity.last_updated = Utc::now();

        debug!(entity = %entity_key, version = entity.version, "State entity written");

        Ok(entity.version)
    }

    /// Applies every write or none
    ///
    /// All ownership and version checks run before the first write lands.
    pub fn write_batch(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let _gate = self.commit_gate.write();

        let mut seen = HashSet::new();
        for op in &ops {
            if !seen.insert(op.entity.clone()) {
                return Err(Error::Validation(format!(
                    "Batch writes {} more than once",
                    op.entity
                )));
            }
            let entity = self
                .entities
                .get(&op.entity)
                .ok_or_else(|| Error::NotFound(format!("State entity {}", op.entity)))?;
            Self::check_write(&entity, &op.entity, op.expected_version, op.writer)?;
        }

        let now = Utc::now();
        let mut versions = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(mut entity) = self.entities.get_mut(&op.entity) {
                entity.value = op.value;
                entity.version += 1;
                entity.last_updated = now;
                versions.push(entity.version);
            }
        }

        debug!(count = versions.len(), "Batch write applied");

        Ok(versions)
    }

    /// Bumps an entity's version without changing its value
    ///
    /// Used by the repair pass so dependents see a newer version than any
    /// cache they may hold.
    pub fn force_bump(&self, entity: &EntityKey) -> Result<Versioned> {
        let _gate = self.commit_gate.read();

        let mut current = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| Error::NotFound(format!("State entity {}", entity)))?;

        current.version += 1;
        current.last_updated = Utc::now();

        info!(entity = %entity, version = current.version, "Forced version bump");

        Ok(Versioned {
            value: current.value.clone(),
            version: current.version,
            last_updated: current.last_updated,
        })
    }

    /// Snapshots of every entity in a domain
    pub fn snapshot_domain(&self, domain: Domain) -> Vec<(EntityKey, Versioned)> {
        let mut entries: Vec<_> = self
            .entities
            .iter()
            .filter(|e| e.key().domain == domain)
            .map(|e| {
                (
                    e.key().clone(),
                    Versioned {
                        value: e.value.clone(),
                        version: e.version,
                        last_updated: e.last_updated,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Removes every entity of a domain, returning how many were removed
    pub fn teardown(&self, domain: Domain) -> usize {
        let _gate = self.commit_gate.write();
        let before = self.entities.len();
        self.entities.retain(|k, _| k.domain != domain);
        let removed = before - self.entities.len();

        info!(%domain, removed, "Domain state torn down");

        removed
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entity is registered
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn check_write(
        entity: &StateEntity,
        entity_key: &EntityKey,
        expected_version: u64,
        writer: Owner,
    ) -> Result<()> {
        if entity.owner != writer {
            return Err(Error::Validation(format!(
                "{} cannot write {}: owned by {}",
                writer, entity_key, entity.owner
            )));
        }

        if entity.version != expected_version {
            return Err(Error::VersionConflict {
                domain: entity_key.domain,
                key: entity_key.key.clone(),
                expected: expected_version,
                actual: entity.version,
            });
        }

        Ok(())
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
