use super::{ActionRecord, Artifact, ArtifactStore, Ledger};
use crate::{DeployError, unit::UnitId};

/// Store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Ledger,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryStore {
    fn get(&self, environment: &str, unit: &UnitId) -> Result<Option<Artifact>, DeployError> {
        Ok(self.ledger.artifact(environment, unit).cloned())
    }

    fn put(&mut self, environment: &str, artifact: Artifact) -> Result<(), DeployError> {
        self.ledger.check_artifact(environment, &artifact)?;
        self.ledger.insert_artifact(artifact);
        Ok(())
    }

    fn action(
        &self,
        environment: &str,
        unit: &UnitId,
        action_key: &str,
    ) -> Result<Option<ActionRecord>, DeployError> {
        Ok(self.ledger.action(environment, unit, action_key).cloned())
    }

    fn record_action(
        &mut self,
        environment: &str,
        record: ActionRecord,
    ) -> Result<(), DeployError> {
        self.ledger.check_action(environment, &record)?;
        self.ledger.insert_action(environment, record);
        Ok(())
    }

    fn artifacts(&self, environment: &str) -> Result<Vec<Artifact>, DeployError> {
        Ok(self.ledger.artifacts_of(environment))
    }

    fn actions(&self, environment: &str) -> Result<Vec<ActionRecord>, DeployError> {
        Ok(self.ledger.actions_of(environment))
    }
}
