//! Executes a resolved selection of units against one environment.

use std::{collections::BTreeMap, fmt};

use alloy_core::primitives::Address;
use chrono::Utc;
use tracing::Instrument;

use crate::{
    DeployError, Environment, NamedAccounts,
    actions::{ActionSequencer, ActionSummary},
    cancel::CancelSignal,
    chain::ChainClient,
    context::UnitContext,
    graph::ValidatedGraph,
    retry::RetryPolicy,
    store::{Artifact, ArtifactStore},
    unit::{DeploymentUnit, UnitHandle, UnitId, predict_address},
};

/// Whether a unit was deployed in this run or its artifact reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UnitOutcome {
    Deployed,
    Reused,
}

/// What happened to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: UnitId,
    pub address: Address,
    pub outcome: UnitOutcome,
    pub actions: ActionSummary,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub environment: String,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn deployed(&self) -> usize {
        self.count(UnitOutcome::Deployed)
    }

    pub fn reused(&self) -> usize {
        self.count(UnitOutcome::Reused)
    }

    pub fn actions_applied(&self) -> usize {
        self.units.iter().map(|unit| unit.actions.applied).sum()
    }

    /// Recorded actions whose arguments no longer match their declaration.
    pub fn actions_changed(&self) -> usize {
        self.units.iter().map(|unit| unit.actions.changed).sum()
    }

    fn count(&self, outcome: UnitOutcome) -> usize {
        self.units.iter().filter(|unit| unit.outcome == outcome).count()
    }
}

/// Why a run stopped. Everything persisted before the failure stays valid.
#[derive(Debug)]
pub struct RunFailure {
    /// The unit being processed, if the run got that far.
    pub unit: Option<UnitId>,
    /// The action being processed, if the failure happened in the action phase.
    pub action_key: Option<String>,
    pub error: DeployError,
}

impl RunFailure {
    fn new(unit: Option<&UnitId>, error: DeployError) -> Self {
        Self {
            unit: unit.cloned(),
            action_key: None,
            error,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.unit, &self.action_key) {
            (Some(unit), Some(key)) => write!(f, "unit `{unit}`, action `{key}`: {}", self.error),
            (Some(unit), None) => write!(f, "unit `{unit}`: {}", self.error),
            _ => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Preflight classification of a unit.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UnitState {
    /// A matching artifact is stored.
    UpToDate,
    /// Nothing is stored yet; the next run deploys it.
    Pending,
    /// The stored artifact differs from the current declaration.
    Drifted,
    /// A dependency has no artifact yet, so the unit cannot be described.
    Blocked { dependency: UnitId },
}

/// Status of one unit, as reported by [`ExecutionEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit: UnitId,
    pub state: UnitState,
    pub address: Option<Address>,
    pub actions_recorded: usize,
    pub actions_total: usize,
}

/// Drives units through describe, deploy and actions, in resolved order.
pub struct ExecutionEngine<'a> {
    graph: &'a ValidatedGraph,
    store: &'a mut dyn ArtifactStore,
    chain: &'a dyn ChainClient,
    accounts: &'a NamedAccounts,
    environment: &'a Environment,
    retry: RetryPolicy,
    cancel: CancelSignal,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        graph: &'a ValidatedGraph,
        store: &'a mut dyn ArtifactStore,
        chain: &'a dyn ChainClient,
        accounts: &'a NamedAccounts,
        environment: &'a Environment,
    ) -> Self {
        Self {
            graph,
            store,
            chain,
            accounts,
            environment,
            retry: RetryPolicy::default(),
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `selection` in order, stopping at the first failure.
    pub async fn run(&mut self, selection: &[UnitHandle]) -> Result<RunReport, RunFailure> {
        let environment = self.environment;
        let graph = self.graph;

        self.check_roles(selection)?;
        self.store
            .begin(&environment.name)
            .map_err(|error| RunFailure::new(None, error))?;

        tracing::info!(
            environment = %environment.name,
            chain_id = environment.chain_id,
            units = selection.len(),
            "Starting deployment run"
        );

        let mut report = RunReport {
            environment: environment.name.clone(),
            units: Vec::with_capacity(selection.len()),
        };

        for &handle in selection {
            let unit = graph.unit(handle);
            let span = tracing::info_span!("unit", unit = %unit.id());
            report.units.push(self.run_unit(unit).instrument(span).await?);
        }

        tracing::info!(
            deployed = report.deployed(),
            reused = report.reused(),
            actions_applied = report.actions_applied(),
            actions_changed = report.actions_changed(),
            "Deployment run complete"
        );

        Ok(report)
    }

    /// Resolve every account role the selection uses before anything is submitted.
    fn check_roles(&self, selection: &[UnitHandle]) -> Result<(), RunFailure> {
        for &handle in selection {
            let unit = self.graph.unit(handle);
            let roles = unit
                .script()
                .roles()
                .into_iter()
                .chain(unit.actions().iter().flat_map(|action| action.roles()));

            for role in roles {
                self.accounts
                    .resolve(&role)
                    .map_err(|error| RunFailure::new(Some(unit.id()), error))?;
            }
        }
        Ok(())
    }

    async fn run_unit(&mut self, unit: &DeploymentUnit) -> Result<UnitReport, RunFailure> {
        let environment = self.environment;
        let fail = |error| RunFailure::new(Some(unit.id()), error);

        self.cancel.check().map_err(fail)?;

        let dependencies = self.dependency_artifacts(unit).map_err(fail)?;
        let ctx = UnitContext::new(
            unit.id(),
            unit.dependencies(),
            environment,
            self.accounts,
            self.chain,
            dependencies,
        );

        let description = unit.script().describe(&ctx).map_err(fail)?;
        let args_fingerprint = description.args_fingerprint();
        let code_fingerprint = description.code_fingerprint();

        let stored = self.store.get(&environment.name, unit.id()).map_err(fail)?;
        let (artifact, outcome) = match stored {
            Some(stored) if stored.matches(&args_fingerprint, &code_fingerprint) => {
                tracing::info!(address = %stored.address, "Reusing recorded artifact");
                (stored, UnitOutcome::Reused)
            }
            Some(stored) => {
                tracing::warn!(
                    stored_args = %stored.args_fingerprint,
                    current_args = %args_fingerprint,
                    stored_code = %stored.code_fingerprint,
                    current_code = %code_fingerprint,
                    "Unit drifted from its recorded artifact"
                );
                return Err(fail(DeployError::Drift {
                    unit: unit.id().clone(),
                    stored_args: stored.args_fingerprint,
                    current_args: args_fingerprint,
                    stored_code: stored.code_fingerprint,
                    current_code: code_fingerprint,
                }));
            }
            None => {
                let predicted = self
                    .retry
                    .run(&format!("predict {}", unit.id()), || {
                        predict_address(&ctx, &description)
                    })
                    .await
                    .map_err(fail)?;
                tracing::debug!(%predicted, "Predicted deployment address");

                let deployed = self
                    .retry
                    .run(&format!("deploy {}", unit.id()), || {
                        unit.script().deploy(&ctx, &description, predicted)
                    })
                    .await
                    .map_err(fail)?;

                let artifact = Artifact {
                    unit_id: unit.id().clone(),
                    environment: environment.name.clone(),
                    contract: description.code.name.clone(),
                    address: deployed.address,
                    args_fingerprint,
                    code_fingerprint,
                    transaction_hash: deployed.transaction_hash,
                    created_at: Utc::now(),
                };
                self.store
                    .put(&environment.name, artifact.clone())
                    .map_err(fail)?;

                (artifact, UnitOutcome::Deployed)
            }
        };

        let address = artifact.address;
        let ctx = ctx.with_artifact(artifact);

        let actions = ActionSequencer::new(&environment.name, &self.retry, &self.cancel)
            .run(unit, &ctx, &mut *self.store)
            .await
            .map_err(|failure| RunFailure {
                unit: Some(unit.id().clone()),
                action_key: Some(failure.action_key),
                error: failure.error,
            })?;

        Ok(UnitReport {
            unit: unit.id().clone(),
            address,
            outcome,
            actions,
        })
    }

    /// Stored artifacts of the declared dependencies of `unit`.
    fn dependency_artifacts(
        &self,
        unit: &DeploymentUnit,
    ) -> Result<BTreeMap<UnitId, Artifact>, DeployError> {
        let environment = &self.environment.name;
        unit.dependencies()
            .iter()
            .map(|dependency| {
                let artifact = self.store.get(environment, dependency)?.ok_or_else(|| {
                    DeployError::Script(anyhow::anyhow!(
                        "dependency `{dependency}` of `{}` has no artifact in `{environment}`",
                        unit.id()
                    ))
                })?;
                Ok((dependency.clone(), artifact))
            })
            .collect()
    }

    /// Classify `selection` against the store without submitting anything.
    ///
    /// Units are visited in order as if the run had succeeded up to them: a unit
    /// whose dependency is pending is reported as blocked.
    pub fn status(&mut self, selection: &[UnitHandle]) -> Result<Vec<UnitStatus>, DeployError> {
        let environment = self.environment;
        let graph = self.graph;
        self.store.begin(&environment.name)?;

        let mut statuses = Vec::with_capacity(selection.len());
        for &handle in selection {
            let unit = graph.unit(handle);
            let stored = self.store.get(&environment.name, unit.id())?;

            let actions_recorded = (0..unit.actions().len())
                .filter_map(|ordinal| unit.action_key(ordinal))
                .map(|key| self.store.action(&environment.name, unit.id(), &key))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .count();

            let state = self.classify(unit, stored.as_ref())?;
            tracing::debug!(unit = %unit.id(), %state, "Classified unit");

            statuses.push(UnitStatus {
                unit: unit.id().clone(),
                state,
                address: stored.map(|artifact| artifact.address),
                actions_recorded,
                actions_total: unit.actions().len(),
            });
        }

        Ok(statuses)
    }

    fn classify(
        &self,
        unit: &DeploymentUnit,
        stored: Option<&Artifact>,
    ) -> Result<UnitState, DeployError> {
        let environment = &self.environment.name;
        for dependency in unit.dependencies() {
            if self.store.get(environment, dependency)?.is_none() {
                return Ok(UnitState::Blocked {
                    dependency: dependency.clone(),
                });
            }
        }

        let Some(stored) = stored else {
            return Ok(UnitState::Pending);
        };

        let ctx = UnitContext::new(
            unit.id(),
            unit.dependencies(),
            self.environment,
            self.accounts,
            self.chain,
            self.dependency_artifacts(unit)?,
        );
        let description = unit.script().describe(&ctx)?;

        if stored.matches(&description.args_fingerprint(), &description.code_fingerprint()) {
            Ok(UnitState::UpToDate)
        } else {
            Ok(UnitState::Drifted)
        }
    }
}
