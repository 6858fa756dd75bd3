//! Error taxonomy for plan validation and execution.

use std::path::PathBuf;

use crate::{chain::ClientError, fingerprint::Fingerprint, unit::UnitId};

/// Structural errors detected before anything is executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Two units were registered under the same id.
    #[error("unit `{0}` is already registered")]
    DuplicateId(UnitId),

    /// A unit depends on an id that was never registered.
    #[error("unit `{unit}` depends on unregistered unit `{dependency}`")]
    MissingDependency { unit: UnitId, dependency: UnitId },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<UnitId> },

    /// A tag filter matched no registered unit.
    #[error("no unit is tagged `{0}`")]
    UnknownTag(String),
}

fn format_cycle(path: &[UnitId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Coarse classification of a [`DeployError`], used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Drift,
    NetworkTimeout,
    Revert,
    ActionNotConverged,
    StoreConsistency,
    ConcurrentRun,
    UnknownRole,
    UndeclaredDependency,
    Cancelled,
    Io,
    Script,
}

/// Errors raised while executing a deployment plan.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The stored artifact no longer matches the unit's declaration.
    #[error(
        "unit `{unit}` drifted from its recorded artifact \
         (args {stored_args} -> {current_args}, code {stored_code} -> {current_code})"
    )]
    Drift {
        unit: UnitId,
        stored_args: Fingerprint,
        current_args: Fingerprint,
        stored_code: Fingerprint,
        current_code: Fingerprint,
    },

    /// A network call did not resolve within its timeout, after all retries.
    #[error("`{operation}` timed out after {attempts} attempt(s)")]
    NetworkTimeout { operation: String, attempts: usize },

    /// The target system rejected a deployment or transaction.
    #[error("`{operation}` reverted: {reason}")]
    Revert { operation: String, reason: String },

    /// An action was applied but its predicate still does not hold.
    #[error("action `{action_key}` on unit `{unit}` did not converge")]
    ActionNotConverged { unit: UnitId, action_key: String },

    /// A record was written twice for the same key.
    #[error("store already holds a record for `{key}` in environment `{environment}`")]
    ArtifactStoreConsistency { environment: String, key: String },

    /// Another process is running against the same environment.
    #[error("environment `{environment}` is locked by another run ({})", .lock_path.display())]
    ConcurrentRun {
        environment: String,
        lock_path: PathBuf,
    },

    #[error("role `{role}` is not configured for environment `{environment}`")]
    UnknownRole { role: String, environment: String },

    /// A unit read the artifact of a unit it did not declare as a dependency.
    #[error("unit `{unit}` accessed `{requested}` without declaring it as a dependency")]
    UndeclaredDependencyAccess { unit: UnitId, requested: UnitId },

    #[error("run cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// An error raised from inside a unit's own script logic.
    #[error(transparent)]
    Script(#[from] anyhow::Error),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Drift { .. } => ErrorKind::Drift,
            Self::NetworkTimeout { .. } => ErrorKind::NetworkTimeout,
            Self::Revert { .. } => ErrorKind::Revert,
            Self::ActionNotConverged { .. } => ErrorKind::ActionNotConverged,
            Self::ArtifactStoreConsistency { .. } => ErrorKind::StoreConsistency,
            Self::ConcurrentRun { .. } => ErrorKind::ConcurrentRun,
            Self::UnknownRole { .. } => ErrorKind::UnknownRole,
            Self::UndeclaredDependencyAccess { .. } => ErrorKind::UndeclaredDependency,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io { .. } => ErrorKind::Io,
            Self::Script(_) => ErrorKind::Script,
        }
    }

    /// Only network timeouts are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTimeout { .. })
    }

    /// Errors that can be reported before any transaction is submitted.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Drift | ErrorKind::UnknownRole
        )
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Map a chain client failure for the given operation.
    pub fn from_client(operation: impl Into<String>, err: ClientError) -> Self {
        let operation = operation.into();
        match err {
            ClientError::Timeout => Self::NetworkTimeout {
                operation,
                attempts: 1,
            },
            ClientError::Revert(reason) => Self::Revert { operation, reason },
            ClientError::Transport(message) => {
                Self::Script(anyhow::anyhow!("`{operation}` failed: {message}"))
            }
        }
    }
}
