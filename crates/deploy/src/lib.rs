//! plinth-deploy - Resumable, dependency-ordered smart contract deployments.
//!
//! A deployment plan is a set of [`DeploymentUnit`]s, each producing one
//! contract [`Artifact`] and followed by idempotent post-deployment
//! [`Action`]s. Units are registered in a [`DeploymentGraph`], validated,
//! ordered by the [`Resolver`] and executed by the [`ExecutionEngine`] against
//! one [`Environment`]. Everything that completes is recorded in an
//! [`ArtifactStore`], so an interrupted run resumes exactly where it stopped.

mod accounts;
mod actions;
mod args;
mod cancel;
pub mod chain;
mod config;
mod context;
mod engine;
mod environment;
mod error;
mod fingerprint;
mod graph;
mod resolver;
mod retry;
pub mod store;
mod unit;

pub use accounts::{
    AccountRef, DEFAULT_DEV_ACCOUNT_COUNT, DEFAULT_DEV_MNEMONIC, NamedAccounts, RoleSpec,
    dev_accounts,
};
pub use actions::{Action, ActionFailure, ActionSequencer, ActionSummary, Invoke, action_key};
pub use args::{Arg, address_value};
pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use chain::{ChainClient, ClientError, DETERMINISTIC_DEPLOYER, InMemoryChain};
pub use config::{
    EnvironmentConfig, LOCAL_CHAIN_ID, PLINTH_CONFIG_FILENAME, PLINTH_ENV_PREFIX, PlinthConfig,
};
pub use context::UnitContext;
pub use engine::{
    ExecutionEngine, RunFailure, RunReport, UnitOutcome, UnitReport, UnitState, UnitStatus,
};
pub use environment::Environment;
pub use error::{DeployError, ErrorKind, ValidationError};
pub use fingerprint::{Fingerprint, canonical_json};
pub use graph::{DeploymentGraph, ValidatedGraph};
pub use resolver::Resolver;
pub use retry::RetryPolicy;
pub use store::{ActionRecord, Artifact, ArtifactStore, FileStore, MemoryStore};
pub use unit::{
    ContractCode, ContractDeployment, DeploymentUnit, UnitDescription, UnitHandle, UnitId,
    UnitScript, deploy_contract, predict_address,
};
