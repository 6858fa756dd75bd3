//! Context passed to unit scripts and actions.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;

use crate::{
    DeployError, Environment, NamedAccounts,
    chain::ChainClient,
    store::Artifact,
    unit::UnitId,
};

/// Read-only view of the run given to a unit's describe, deploy and action steps.
///
/// Only artifacts of the unit's declared dependencies (and, once resolved, the
/// unit's own artifact) are reachable; anything else is a programming error
/// reported as [`DeployError::UndeclaredDependencyAccess`].
pub struct UnitContext<'a> {
    unit: &'a UnitId,
    declared: &'a [UnitId],
    environment: &'a Environment,
    accounts: &'a NamedAccounts,
    chain: &'a dyn ChainClient,
    dependencies: BTreeMap<UnitId, Artifact>,
    artifact: Option<Artifact>,
}

impl<'a> UnitContext<'a> {
    pub(crate) fn new(
        unit: &'a UnitId,
        declared: &'a [UnitId],
        environment: &'a Environment,
        accounts: &'a NamedAccounts,
        chain: &'a dyn ChainClient,
        dependencies: BTreeMap<UnitId, Artifact>,
    ) -> Self {
        Self {
            unit,
            declared,
            environment,
            accounts,
            chain,
            dependencies,
            artifact: None,
        }
    }

    /// Attach the unit's own resolved artifact, for the action phase.
    pub(crate) fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn unit_id(&self) -> &UnitId {
        self.unit
    }

    pub fn environment(&self) -> &Environment {
        self.environment
    }

    pub fn accounts(&self) -> &NamedAccounts {
        self.accounts
    }

    pub fn chain(&self) -> &dyn ChainClient {
        self.chain
    }

    /// The unit's own artifact. Available to actions, not to describe/deploy.
    pub fn own_artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    /// Artifact of a declared dependency, or of the unit itself.
    pub fn artifact(&self, id: &str) -> Result<&Artifact, DeployError> {
        if self.unit == id {
            return self.artifact.as_ref().ok_or_else(|| {
                DeployError::Script(anyhow::anyhow!(
                    "unit `{id}` has no artifact before it is deployed"
                ))
            });
        }

        if !self.declared.iter().any(|dep| dep == id) {
            return Err(DeployError::UndeclaredDependencyAccess {
                unit: self.unit.clone(),
                requested: id.into(),
            });
        }

        self.dependencies.get(id).ok_or_else(|| {
            DeployError::Script(anyhow::anyhow!(
                "artifact of dependency `{id}` is not available yet"
            ))
        })
    }

    pub fn address_of(&self, id: &str) -> Result<Address, DeployError> {
        self.artifact(id).map(|artifact| artifact.address)
    }
}
