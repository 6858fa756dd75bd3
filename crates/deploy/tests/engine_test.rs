//! End-to-end tests of the execution engine against the in-memory chain.
//!
//! Every test drives a small Oracle/Lending plan: `Lending` takes the oracle's
//! address as a constructor argument, and both units carry one action.
//! Run with: cargo test --test engine_test

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use plinth_deploy::{
    ActionRecord, Arg, Artifact, ArtifactStore, CancelHandle, ContractCode, ContractDeployment,
    DeployError, DeploymentGraph, DeploymentUnit, Environment, ErrorKind, ExecutionEngine,
    FileStore, Invoke, MemoryStore, NamedAccounts, Resolver, RetryPolicy, RunFailure, RunReport,
    UnitContext, UnitDescription, UnitId, UnitOutcome, UnitScript, UnitState, ValidatedGraph,
    ValidationError, address_value, cancel_pair,
    chain::{Deployed, Fault, FaultTarget, InMemoryChain},
};
use tempdir::TempDir;

const ENVIRONMENT: &str = "localhost";

fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Shared chain, accounts and environment of one test.
struct TestContext {
    chain: InMemoryChain,
    environment: Environment,
    accounts: NamedAccounts,
    retry: RetryPolicy,
}

impl TestContext {
    fn new() -> Self {
        Self::with_chain(InMemoryChain::new())
    }

    fn with_chain(chain: InMemoryChain) -> Self {
        init_test_tracing();

        let roles = BTreeMap::from([
            ("deployer".to_string(), Address::repeat_byte(0xd0)),
            ("lender".to_string(), Address::repeat_byte(0x1e)),
        ]);

        Self {
            chain,
            environment: Environment::new(ENVIRONMENT, 31337).tag("local"),
            accounts: NamedAccounts::new(ENVIRONMENT, roles),
            retry: RetryPolicy::immediate(2),
        }
    }

    fn engine<'a>(
        &'a self,
        graph: &'a ValidatedGraph,
        store: &'a mut dyn ArtifactStore,
    ) -> ExecutionEngine<'a> {
        ExecutionEngine::new(graph, store, &self.chain, &self.accounts, &self.environment)
            .with_retry(self.retry)
    }

    async fn run(
        &self,
        graph: &ValidatedGraph,
        store: &mut dyn ArtifactStore,
    ) -> Result<RunReport, RunFailure> {
        self.engine(graph, store).run(&Resolver::order(graph)).await
    }
}

fn code(name: &str) -> ContractCode {
    ContractCode::new(name, name.as_bytes().to_vec())
}

fn oracle(version: &str) -> DeploymentUnit {
    DeploymentUnit::new("Oracle", ContractDeployment::new(code("Oracle")).arg(Arg::value(version)))
        .tag("core")
        .action(Invoke::new("Oracle", "setPrice").arg(Arg::value("USDC")).arg(100u64))
}

fn lending() -> DeploymentUnit {
    DeploymentUnit::new(
        "Lending",
        ContractDeployment::new(code("Lending")).arg(Arg::address_of("Oracle")),
    )
    .depends_on(["Oracle"])
    .tag("core")
    .action(Invoke::new("Lending", "setOracle").arg(Arg::address_of("Oracle")))
}

fn validated(units: Vec<DeploymentUnit>) -> Result<ValidatedGraph> {
    let mut graph = DeploymentGraph::new();
    for unit in units {
        graph.register(unit)?;
    }
    Ok(graph.validate()?)
}

fn plan() -> Result<ValidatedGraph> {
    validated(vec![oracle("v1"), lending()])
}

fn address_of(store: &dyn ArtifactStore, unit: &str) -> Result<Address> {
    let artifact = store
        .get(ENVIRONMENT, &unit.into())?
        .ok_or_else(|| anyhow::anyhow!("no artifact for {unit}"))?;
    Ok(artifact.address)
}

#[tokio::test]
async fn test_fresh_run_deploys_in_order_and_applies_actions() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    let report = ctx.run(&graph, &mut store).await?;

    let order: Vec<_> = report.units.iter().map(|unit| unit.unit.to_string()).collect();
    assert_eq!(order, vec!["Oracle", "Lending"]);
    assert_eq!(report.deployed(), 2);
    assert_eq!(report.actions_applied(), 2);
    assert_eq!(ctx.chain.deployment_count(), 2);
    assert_eq!(ctx.chain.transaction_count(), 2);

    let oracle = address_of(&store, "Oracle")?;
    let lending = address_of(&store, "Lending")?;
    assert_eq!(ctx.chain.slot(lending, "oracle", &[]), Some(address_value(oracle)));
    assert_eq!(store.actions(ENVIRONMENT)?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_second_run_is_a_no_op() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    ctx.run(&graph, &mut store).await?;
    let report = ctx.run(&graph, &mut store).await?;

    assert_eq!(report.deployed(), 0);
    assert_eq!(report.reused(), 2);
    assert_eq!(report.actions_applied(), 0);
    assert!(report.units.iter().all(|unit| unit.actions.skipped == 1));
    assert_eq!(ctx.chain.deployment_count(), 2);
    assert_eq!(ctx.chain.transaction_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_changed_arguments_are_reported_as_drift() -> Result<()> {
    let ctx = TestContext::new();
    let mut store = MemoryStore::new();
    ctx.run(&plan()?, &mut store).await?;

    let changed = validated(vec![oracle("v2"), lending()])?;
    let failure = ctx.run(&changed, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Oracle".into()));
    assert_eq!(failure.error.kind(), ErrorKind::Drift);
    assert!(failure.error.is_preflight());
    match failure.error {
        DeployError::Drift {
            stored_args,
            current_args,
            stored_code,
            current_code,
            ..
        } => {
            assert_ne!(stored_args, current_args);
            assert_eq!(stored_code, current_code);
        }
        other => panic!("expected drift, got {other:?}"),
    }
    assert_eq!(ctx.chain.deployment_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_deployment() -> Result<()> {
    let ctx = TestContext::new();
    let mut graph = DeploymentGraph::new();
    graph.register(oracle("v1").depends_on(["Lending"]))?;
    graph.register(lending())?;

    let err = graph.validate().unwrap_err();

    assert_eq!(
        err,
        ValidationError::Cycle {
            path: vec!["Oracle".into(), "Lending".into(), "Oracle".into()],
        }
    );
    assert_eq!(ctx.chain.deployment_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_resume_after_failed_action() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    ctx.chain.inject(
        FaultTarget::Send("setOracle".to_string()),
        Fault::Revert("paused".to_string()),
    );
    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Lending".into()));
    assert_eq!(failure.action_key.as_deref(), Some("00-setOracle"));
    assert_eq!(failure.error.kind(), ErrorKind::Revert);
    // Both artifacts were persisted before the action phase failed.
    assert_eq!(store.artifacts(ENVIRONMENT)?.len(), 2);

    let report = ctx.run(&graph, &mut store).await?;

    assert_eq!(report.deployed(), 0);
    assert_eq!(report.actions_applied(), 1);
    assert_eq!(ctx.chain.deployment_count(), 2);
    assert_eq!(store.actions(ENVIRONMENT)?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_deploy_timeout_is_retried() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    ctx.chain
        .inject(FaultTarget::Deploy("Oracle".to_string()), Fault::Timeout);
    let report = ctx.run(&graph, &mut store).await?;

    assert_eq!(report.deployed(), 2);
    assert_eq!(ctx.chain.deployment_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_the_unit() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    for _ in 0..3 {
        ctx.chain
            .inject(FaultTarget::Deploy("Lending".to_string()), Fault::Timeout);
    }
    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Lending".into()));
    assert!(matches!(
        failure.error,
        DeployError::NetworkTimeout { attempts: 3, .. }
    ));
    assert!(store.get(ENVIRONMENT, &"Lending".into())?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_lost_deterministic_deploy_is_adopted() -> Result<()> {
    let ctx = TestContext::new();
    let deterministic = DeploymentUnit::new(
        "Oracle",
        ContractDeployment::new(code("Oracle"))
            .arg(Arg::value("v1"))
            .deterministic(),
    );
    let graph = validated(vec![deterministic, lending()])?;
    let mut store = MemoryStore::new();

    ctx.chain.inject(
        FaultTarget::Deploy("Oracle".to_string()),
        Fault::TimeoutAfterApply,
    );
    ctx.run(&graph, &mut store).await?;

    let artifact = store
        .get(ENVIRONMENT, &"Oracle".into())?
        .expect("oracle artifact");
    assert_eq!(ctx.chain.deployment_count(), 2);
    assert_eq!(artifact.transaction_hash, None);

    // The same declaration lands on the same address on a fresh chain.
    let other = TestContext::new();
    let mut other_store = MemoryStore::new();
    other.run(&graph, &mut other_store).await?;
    assert_eq!(address_of(&other_store, "Oracle")?, artifact.address);

    Ok(())
}

#[tokio::test]
async fn test_lost_plain_deploy_is_adopted() -> Result<()> {
    let ctx = TestContext::new();
    let graph = validated(vec![oracle("v1")])?;
    let mut store = MemoryStore::new();

    ctx.chain.inject(
        FaultTarget::Deploy("Oracle".to_string()),
        Fault::TimeoutAfterApply,
    );
    let report = ctx.run(&graph, &mut store).await?;

    assert_eq!(report.deployed(), 1);
    assert_eq!(ctx.chain.deployment_count(), 1);
    assert_eq!(address_of(&store, "Oracle")?, Address::repeat_byte(0xd0).create(0));
    assert_eq!(report.actions_applied(), 1);

    Ok(())
}

#[tokio::test]
async fn test_revert_halts_the_run() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    ctx.chain.inject(
        FaultTarget::Deploy("Lending".to_string()),
        Fault::Revert("out of gas".to_string()),
    );
    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Lending".into()));
    assert_eq!(failure.action_key, None);
    assert!(!failure.error.is_retryable());
    assert!(store.get(ENVIRONMENT, &"Oracle".into())?.is_some());
    assert!(store.get(ENVIRONMENT, &"Lending".into())?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_inert_action_does_not_converge() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();

    ctx.chain.make_inert("setPrice");
    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Oracle".into()));
    assert_eq!(failure.action_key.as_deref(), Some("00-setPrice"));
    assert_eq!(failure.error.kind(), ErrorKind::ActionNotConverged);
    assert!(store.actions(ENVIRONMENT)?.is_empty());

    Ok(())
}

/// Deploys normally, then requests cancellation of the run.
struct CancellingScript {
    inner: ContractDeployment,
    handle: CancelHandle,
}

#[async_trait]
impl UnitScript for CancellingScript {
    fn describe(&self, ctx: &UnitContext<'_>) -> Result<UnitDescription, DeployError> {
        self.inner.describe(ctx)
    }

    async fn deploy(
        &self,
        ctx: &UnitContext<'_>,
        description: &UnitDescription,
        predicted: Address,
    ) -> Result<Deployed, DeployError> {
        let deployed = self.inner.deploy(ctx, description, predicted).await?;
        self.handle.cancel();
        Ok(deployed)
    }
}

#[tokio::test]
async fn test_cancellation_keeps_completed_work() -> Result<()> {
    let ctx = TestContext::new();
    let (handle, signal) = cancel_pair();
    let cancelling = DeploymentUnit::new(
        "Oracle",
        CancellingScript {
            inner: ContractDeployment::new(code("Oracle")).arg(Arg::value("v1")),
            handle,
        },
    )
    .action(Invoke::new("Oracle", "setPrice").arg(Arg::value("USDC")).arg(100u64));
    let graph = validated(vec![cancelling, lending()])?;
    let mut store = MemoryStore::new();

    let failure = ctx
        .engine(&graph, &mut store)
        .with_cancel(signal)
        .run(&Resolver::order(&graph))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, DeployError::Cancelled));
    assert!(store.get(ENVIRONMENT, &"Oracle".into())?.is_some());
    assert!(store.get(ENVIRONMENT, &"Lending".into())?.is_none());
    assert_eq!(ctx.chain.transaction_count(), 0);

    assert_eq!(failure.action_key.as_deref(), Some("00-setPrice"));

    // The next run picks up at the interrupted action.
    let report = ctx.run(&graph, &mut store).await?;
    assert_eq!(report.reused(), 1);
    assert_eq!(report.deployed(), 1);
    assert_eq!(report.actions_applied(), 2);

    Ok(())
}

#[tokio::test]
async fn test_tag_selection_includes_dependencies() -> Result<()> {
    let ctx = TestContext::new();
    let faucet = DeploymentUnit::new("Faucet", ContractDeployment::new(code("Faucet")));
    let graph = validated(vec![faucet, oracle("v1"), lending()])?;
    let mut store = MemoryStore::new();

    let selection = Resolver::select(&graph, &["Lending".to_string()])?;
    let report = ctx.engine(&graph, &mut store).run(&selection).await?;

    let deployed: Vec<_> = report.units.iter().map(|unit| unit.unit.to_string()).collect();
    assert_eq!(deployed, vec!["Oracle", "Lending"]);
    assert!(store.get(ENVIRONMENT, &"Faucet".into())?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_undeclared_dependency_access_fails() -> Result<()> {
    let ctx = TestContext::new();
    let sneaky = DeploymentUnit::new(
        "Lending",
        ContractDeployment::new(code("Lending")).arg(Arg::address_of("Oracle")),
    );
    let graph = validated(vec![oracle("v1"), sneaky])?;
    let mut store = MemoryStore::new();

    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Lending".into()));
    assert_eq!(failure.error.kind(), ErrorKind::UndeclaredDependency);
    assert_eq!(ctx.chain.deployment_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_unknown_role_is_a_preflight_error() -> Result<()> {
    let ctx = TestContext::new();
    let audited = DeploymentUnit::new(
        "Oracle",
        ContractDeployment::new(code("Oracle")).from("auditor"),
    );
    let graph = validated(vec![audited])?;
    let mut store = MemoryStore::new();

    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.error.kind(), ErrorKind::UnknownRole);
    assert!(failure.error.is_preflight());
    assert_eq!(ctx.chain.deployment_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_action_role_fails_before_any_deployment() -> Result<()> {
    let ctx = TestContext::new();
    let audited = lending().action(
        Invoke::new("Lending", "setAuditor")
            .from("lender")
            .arg(Arg::account("auditor")),
    );
    let graph = validated(vec![oracle("v1"), audited])?;
    let mut store = MemoryStore::new();

    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, Some("Lending".into()));
    assert_eq!(failure.error.kind(), ErrorKind::UnknownRole);
    assert_eq!(ctx.chain.deployment_count(), 0);
    assert!(store.artifacts(ENVIRONMENT)?.is_empty());

    Ok(())
}

/// Store whose reads of one unit's artifact fail.
struct UnreadableStore {
    inner: MemoryStore,
    unreadable: &'static str,
}

impl ArtifactStore for UnreadableStore {
    fn get(&self, environment: &str, unit: &UnitId) -> Result<Option<Artifact>, DeployError> {
        if unit.as_str() == self.unreadable {
            return Err(DeployError::Script(anyhow::anyhow!("{unit} is unreadable")));
        }
        self.inner.get(environment, unit)
    }

    fn put(&mut self, environment: &str, artifact: Artifact) -> Result<(), DeployError> {
        self.inner.put(environment, artifact)
    }

    fn action(
        &self,
        environment: &str,
        unit: &UnitId,
        action_key: &str,
    ) -> Result<Option<ActionRecord>, DeployError> {
        self.inner.action(environment, unit, action_key)
    }

    fn record_action(
        &mut self,
        environment: &str,
        record: ActionRecord,
    ) -> Result<(), DeployError> {
        self.inner.record_action(environment, record)
    }

    fn artifacts(&self, environment: &str) -> Result<Vec<Artifact>, DeployError> {
        self.inner.artifacts(environment)
    }

    fn actions(&self, environment: &str) -> Result<Vec<ActionRecord>, DeployError> {
        self.inner.actions(environment)
    }
}

#[tokio::test]
async fn test_status_reports_dependency_read_errors() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let lending = graph
        .handle("Lending")
        .ok_or_else(|| anyhow::anyhow!("Lending is registered"))?;
    let mut store = UnreadableStore {
        inner: MemoryStore::new(),
        unreadable: "Oracle",
    };

    let result = ctx.engine(&graph, &mut store).status(&[lending]);

    assert!(matches!(result, Err(DeployError::Script(_))));

    Ok(())
}

#[tokio::test]
async fn test_status_classifies_units() -> Result<()> {
    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = MemoryStore::new();
    let selection = Resolver::order(&graph);

    let before = ctx.engine(&graph, &mut store).status(&selection)?;
    assert_eq!(before[0].state, UnitState::Pending);
    assert_eq!(
        before[1].state,
        UnitState::Blocked {
            dependency: "Oracle".into()
        }
    );

    ctx.run(&graph, &mut store).await?;
    let after = ctx.engine(&graph, &mut store).status(&selection)?;
    assert!(after.iter().all(|status| status.state == UnitState::UpToDate));
    assert!(after.iter().all(|status| status.actions_recorded == 1));

    let changed = validated(vec![oracle("v2"), lending()])?;
    let drifted = ctx.engine(&changed, &mut store).status(&selection)?;
    assert_eq!(drifted[0].state, UnitState::Drifted);
    assert_eq!(ctx.chain.transaction_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_file_store_and_chain_survive_restart() -> Result<()> {
    let temp_dir = TempDir::new("plinth-engine")?;
    let chain_state = temp_dir.path().join("chain.json");
    let graph = plan()?;

    {
        let ctx = TestContext::with_chain(InMemoryChain::open(&chain_state)?);
        let mut store = FileStore::open(temp_dir.path(), ENVIRONMENT)?;

        ctx.chain.inject(
            FaultTarget::Deploy("Lending".to_string()),
            Fault::Revert("paused".to_string()),
        );
        assert!(ctx.run(&graph, &mut store).await.is_err());
    }

    let ctx = TestContext::with_chain(InMemoryChain::open(&chain_state)?);
    let mut store = FileStore::open(temp_dir.path(), ENVIRONMENT)?;
    let report = ctx.run(&graph, &mut store).await?;

    let outcomes: Vec<_> = report.units.iter().map(|unit| unit.outcome).collect();
    assert_eq!(outcomes, vec![UnitOutcome::Reused, UnitOutcome::Deployed]);
    assert_eq!(report.actions_applied(), 1);
    assert_eq!(ctx.chain.deployment_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new("plinth-engine")?;
    let _holder = FileStore::open(temp_dir.path(), ENVIRONMENT)?;

    let ctx = TestContext::new();
    let graph = plan()?;
    let mut store = FileStore::new(temp_dir.path());

    let failure = ctx.run(&graph, &mut store).await.unwrap_err();

    assert_eq!(failure.unit, None);
    assert_eq!(failure.error.kind(), ErrorKind::ConcurrentRun);
    assert_eq!(ctx.chain.deployment_count(), 0);

    Ok(())
}
