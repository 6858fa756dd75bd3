//! Persistent record of what has already happened in each environment.
//!
//! The store is the sole source of truth for resumability: an artifact is
//! written as soon as its unit is deployed and an action record as soon as its
//! action converges. Records are append-only; writing a key twice is a
//! consistency error.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeployError, fingerprint::Fingerprint, unit::UnitId};

/// Durable result of a successful unit deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub unit_id: UnitId,
    pub environment: String,
    pub contract: String,
    pub address: Address,
    pub args_fingerprint: Fingerprint,
    pub code_fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Whether this artifact was produced from the same code and arguments.
    pub fn matches(&self, args: &Fingerprint, code: &Fingerprint) -> bool {
        &self.args_fingerprint == args && &self.code_fingerprint == code
    }
}

/// Durable result of a converged post-deployment action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub target_unit_id: UnitId,
    pub action_key: String,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_digest: Option<String>,
    /// Fingerprint of the action's resolved arguments when it was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_fingerprint: Option<Fingerprint>,
}

/// Keyed, append-only storage of artifacts and action records.
pub trait ArtifactStore: Send {
    /// Claim `environment` for a run. Stores that support several writers
    /// refuse a second claim with [`DeployError::ConcurrentRun`].
    fn begin(&mut self, environment: &str) -> Result<(), DeployError> {
        let _ = environment;
        Ok(())
    }

    fn get(&self, environment: &str, unit: &UnitId) -> Result<Option<Artifact>, DeployError>;

    /// Durably append `artifact`. Fails if the key already exists.
    fn put(&mut self, environment: &str, artifact: Artifact) -> Result<(), DeployError>;

    fn action(
        &self,
        environment: &str,
        unit: &UnitId,
        action_key: &str,
    ) -> Result<Option<ActionRecord>, DeployError>;

    /// Durably append `record`. Fails if the key already exists.
    fn record_action(&mut self, environment: &str, record: ActionRecord) -> Result<(), DeployError>;

    /// All artifacts of `environment`, in insertion order.
    fn artifacts(&self, environment: &str) -> Result<Vec<Artifact>, DeployError>;

    /// All action records of `environment`, in insertion order.
    fn actions(&self, environment: &str) -> Result<Vec<ActionRecord>, DeployError>;
}

/// In-memory index shared by the store implementations.
#[derive(Debug, Default)]
struct Ledger {
    artifacts: Vec<Artifact>,
    artifact_index: BTreeMap<(String, UnitId), usize>,
    actions: Vec<(String, ActionRecord)>,
    action_index: BTreeMap<(String, UnitId, String), usize>,
}

impl Ledger {
    fn artifact(&self, environment: &str, unit: &UnitId) -> Option<&Artifact> {
        self.artifact_index
            .get(&(environment.to_string(), unit.clone()))
            .map(|&index| &self.artifacts[index])
    }

    fn action(&self, environment: &str, unit: &UnitId, key: &str) -> Option<&ActionRecord> {
        self.action_index
            .get(&(environment.to_string(), unit.clone(), key.to_string()))
            .map(|&index| &self.actions[index].1)
    }

    /// Check that `artifact` may be appended under `environment`.
    fn check_artifact(&self, environment: &str, artifact: &Artifact) -> Result<(), DeployError> {
        if artifact.environment != environment
            || self.artifact(environment, &artifact.unit_id).is_some()
        {
            return Err(DeployError::ArtifactStoreConsistency {
                environment: environment.to_string(),
                key: artifact.unit_id.to_string(),
            });
        }
        Ok(())
    }

    fn check_action(&self, environment: &str, record: &ActionRecord) -> Result<(), DeployError> {
        if self
            .action(environment, &record.target_unit_id, &record.action_key)
            .is_some()
        {
            return Err(DeployError::ArtifactStoreConsistency {
                environment: environment.to_string(),
                key: format!("{}/{}", record.target_unit_id, record.action_key),
            });
        }
        Ok(())
    }

    fn insert_artifact(&mut self, artifact: Artifact) {
        let key = (artifact.environment.clone(), artifact.unit_id.clone());
        self.artifact_index.insert(key, self.artifacts.len());
        self.artifacts.push(artifact);
    }

    fn insert_action(&mut self, environment: &str, record: ActionRecord) {
        let key = (
            environment.to_string(),
            record.target_unit_id.clone(),
            record.action_key.clone(),
        );
        self.action_index.insert(key, self.actions.len());
        self.actions.push((environment.to_string(), record));
    }

    fn merge(&mut self, other: Ledger) {
        for artifact in other.artifacts {
            self.insert_artifact(artifact);
        }
        for (environment, record) in other.actions {
            self.insert_action(&environment, record);
        }
    }

    fn artifacts_of(&self, environment: &str) -> Vec<Artifact> {
        self.artifacts
            .iter()
            .filter(|artifact| artifact.environment == environment)
            .cloned()
            .collect()
    }

    fn actions_of(&self, environment: &str) -> Vec<ActionRecord> {
        self.actions
            .iter()
            .filter(|(env, _)| env == environment)
            .map(|(_, record)| record.clone())
            .collect()
    }
}
