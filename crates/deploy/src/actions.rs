//! Post-deployment actions and their idempotent sequencing.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::Instrument;

use crate::{
    DeployError,
    args::Arg,
    cancel::CancelSignal,
    chain::{CallRequest, TransactionRequest},
    context::UnitContext,
    fingerprint::Fingerprint,
    retry::RetryPolicy,
    store::{ActionRecord, ArtifactStore},
    unit::{DeploymentUnit, UnitId},
};

/// A state-changing step attached to a unit, guarded by a predicate.
///
/// `is_applied` must reflect the target's observable state: the sequencer skips
/// `apply` whenever it holds, and requires it to hold after `apply`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Short name, part of the action's persisted key.
    fn name(&self) -> &str;

    async fn is_applied(&self, ctx: &UnitContext<'_>) -> Result<bool, DeployError>;

    /// Perform the action. The returned digest is stored with the action record.
    async fn apply(&self, ctx: &UnitContext<'_>) -> Result<Option<String>, DeployError>;

    /// Fingerprint of what the action would submit, stored with its record so
    /// that later runs can tell when the declaration changed.
    fn fingerprint(&self, _ctx: &UnitContext<'_>) -> Result<Option<Fingerprint>, DeployError> {
        Ok(None)
    }

    /// Account roles the action sends from or passes as arguments.
    fn roles(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Calls `method` on the artifact of `target` with the given arguments.
///
/// The predicate reads the value back through a view call taking every argument
/// but the last, and compares it with the last argument (`true` when there are
/// no arguments).
#[derive(Debug, Clone)]
pub struct Invoke {
    name: String,
    target: UnitId,
    method: String,
    view: Option<String>,
    from: String,
    args: Vec<Arg>,
}

impl Invoke {
    pub fn new(target: impl Into<UnitId>, method: impl Into<String>) -> Self {
        let method = method.into();
        Self {
            name: method.clone(),
            target: target.into(),
            method,
            view: None,
            from: "deployer".to_string(),
            args: Vec::new(),
        }
    }

    /// Override the name used in the action key (defaults to the method).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Role of the sending account (defaults to `deployer`).
    pub fn from(mut self, role: impl Into<String>) -> Self {
        self.from = role.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// View method used by the predicate (defaults to the invoked method).
    pub fn view(mut self, method: impl Into<String>) -> Self {
        self.view = Some(method.into());
        self
    }

    fn resolve_args(&self, ctx: &UnitContext<'_>) -> Result<Vec<Value>, DeployError> {
        self.args.iter().map(|arg| arg.resolve(ctx)).collect()
    }
}

#[async_trait]
impl Action for Invoke {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_applied(&self, ctx: &UnitContext<'_>) -> Result<bool, DeployError> {
        let to = ctx.address_of(self.target.as_str())?;
        let mut args = self.resolve_args(ctx)?;
        let expected = args.pop().unwrap_or(Value::Bool(true));

        let method = self.view.as_deref().unwrap_or(&self.method);
        let request = CallRequest {
            to,
            method: method.to_string(),
            args,
        };

        let current = ctx
            .chain()
            .call(&request)
            .await
            .map_err(|e| DeployError::from_client(format!("call {}.{method}", self.target), e))?;

        Ok(current == expected)
    }

    async fn apply(&self, ctx: &UnitContext<'_>) -> Result<Option<String>, DeployError> {
        let request = TransactionRequest {
            from: ctx.accounts().resolve(&self.from)?,
            to: ctx.address_of(self.target.as_str())?,
            method: self.method.clone(),
            args: self.resolve_args(ctx)?,
        };

        let receipt = ctx.chain().send(&request).await.map_err(|e| {
            DeployError::from_client(format!("send {}.{}", self.target, self.method), e)
        })?;

        tracing::debug!(
            target_unit = %self.target,
            method = %self.method,
            tx = %receipt.transaction_hash,
            "Transaction applied"
        );

        Ok(Some(receipt.transaction_hash.to_string()))
    }

    fn fingerprint(&self, ctx: &UnitContext<'_>) -> Result<Option<Fingerprint>, DeployError> {
        let mut submitted = vec![Value::String(self.method.clone())];
        submitted.extend(self.resolve_args(ctx)?);
        Ok(Some(Fingerprint::of_args(&submitted)))
    }

    fn roles(&self) -> Vec<String> {
        std::iter::once(self.from.as_str())
            .chain(self.args.iter().filter_map(Arg::role))
            .map(str::to_string)
            .collect()
    }
}

/// Persisted key of the action at `ordinal`: `00-setPrice`.
pub fn action_key(ordinal: usize, name: &str) -> String {
    format!("{ordinal:02}-{name}")
}

/// Counts of what the sequencer did for one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub applied: usize,
    pub skipped: usize,
    /// Skipped actions whose arguments changed since they were recorded.
    pub changed: usize,
}

/// What happened to a single action.
enum Step {
    Applied,
    Skipped,
    /// Recorded with different arguments than it now resolves to.
    Changed,
}

/// An action that failed, with the key it is persisted under.
#[derive(Debug)]
pub struct ActionFailure {
    pub action_key: String,
    pub error: DeployError,
}

/// Runs a unit's actions in declared order, at most once each.
pub struct ActionSequencer<'a> {
    environment: &'a str,
    retry: &'a RetryPolicy,
    cancel: &'a CancelSignal,
}

impl<'a> ActionSequencer<'a> {
    pub fn new(environment: &'a str, retry: &'a RetryPolicy, cancel: &'a CancelSignal) -> Self {
        Self {
            environment,
            retry,
            cancel,
        }
    }

    /// Bring every action of `unit` to its applied state.
    ///
    /// An action with a stored record is skipped outright. Otherwise its
    /// predicate decides: already satisfied actions are skipped without a
    /// record, the rest are applied, checked again and then recorded.
    pub async fn run(
        &self,
        unit: &DeploymentUnit,
        ctx: &UnitContext<'_>,
        store: &mut dyn ArtifactStore,
    ) -> Result<ActionSummary, ActionFailure> {
        let mut summary = ActionSummary::default();

        for (ordinal, action) in unit.actions().iter().enumerate() {
            let action_key = action_key(ordinal, action.name());
            let span = tracing::info_span!("action", unit = %unit.id(), key = %action_key);

            let outcome = self
                .run_one(unit.id(), &action_key, action.as_ref(), ctx, store)
                .instrument(span)
                .await;

            match outcome {
                Ok(Step::Applied) => summary.applied += 1,
                Ok(Step::Skipped) => summary.skipped += 1,
                Ok(Step::Changed) => {
                    summary.skipped += 1;
                    summary.changed += 1;
                }
                Err(error) => return Err(ActionFailure { action_key, error }),
            }
        }

        Ok(summary)
    }

    async fn run_one(
        &self,
        unit: &UnitId,
        action_key: &str,
        action: &dyn Action,
        ctx: &UnitContext<'_>,
        store: &mut dyn ArtifactStore,
    ) -> Result<Step, DeployError> {
        self.cancel.check()?;

        let fingerprint = action.fingerprint(ctx)?;

        if let Some(record) = store.action(self.environment, unit, action_key)? {
            match (&record.args_fingerprint, &fingerprint) {
                (Some(stored), Some(current)) if stored != current => {
                    tracing::warn!(
                        recorded = %stored,
                        current = %current,
                        "Action arguments changed since it was recorded, not reapplying"
                    );
                    return Ok(Step::Changed);
                }
                _ => {
                    tracing::debug!("Action already recorded, skipping");
                    return Ok(Step::Skipped);
                }
            }
        }

        let check = format!("check {unit}/{action_key}");
        if self.retry.run(&check, || action.is_applied(ctx)).await? {
            tracing::info!("Action already in effect, skipping");
            return Ok(Step::Skipped);
        }

        let mut retrying = false;
        let result_digest = self
            .retry
            .run(&format!("apply {unit}/{action_key}"), || {
                let recheck = retrying;
                retrying = true;
                async move {
                    // A timed-out attempt may still have landed.
                    if recheck && action.is_applied(ctx).await? {
                        return Ok(None);
                    }
                    action.apply(ctx).await
                }
            })
            .await?;

        if !self.retry.run(&check, || action.is_applied(ctx)).await? {
            return Err(DeployError::ActionNotConverged {
                unit: unit.clone(),
                action_key: action_key.to_string(),
            });
        }

        store.record_action(
            self.environment,
            ActionRecord {
                target_unit_id: unit.clone(),
                action_key: action_key.to_string(),
                applied_at: Utc::now(),
                result_digest,
                args_fingerprint: fingerprint,
            },
        )?;

        tracing::info!("Action applied");
        Ok(Step::Applied)
    }
}
