//! plinth deploys a dependency-ordered contract plan and resumes it safely after any failure.

mod cli;
mod plan;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;

use cli::{Cli, Command, Selection};
use plinth_deploy::{
    DeployError, Environment, ExecutionEngine, FileStore, InMemoryChain, PlinthConfig, Resolver,
    RunFailure, RunReport, UnitHandle, UnitStatus, ValidatedGraph, cancel_pair,
};

/// Exit code of a run stopped by the operator.
const EXIT_CANCELLED: u8 = 130;
/// Exit code of a failure detected before anything was submitted.
const EXIT_PREFLIGHT: u8 = 2;
/// Exit code of a failure in the middle of a run.
const EXIT_EXECUTION: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            tracing::error!(exit_code = code, "{err:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PlinthConfig::load(&cli.config)?;
    let environment = config.environment(&cli.env)?;

    let graph = plan::lending_plan(&config)?.validate()?;

    match cli.command {
        Command::Order(selection) => {
            let order = select(&graph, &selection)?;
            println!("{}", order_table(&graph, &order));
        }
        Command::Status(selection) => {
            let order = select(&graph, &selection)?;
            let statuses = status(&config, &environment, &graph, &order)?;
            println!("{}", status_table(&statuses));
        }
        Command::Deploy(selection) => {
            let order = select(&graph, &selection)?;
            let report = deploy(&config, &environment, &graph, &order).await?;
            println!("{}", report_table(&report));
        }
    }

    Ok(())
}

fn select(graph: &ValidatedGraph, selection: &Selection) -> Result<Vec<UnitHandle>> {
    let order = Resolver::select(graph, &selection.tags)?;
    tracing::debug!(tags = ?selection.tags, units = order.len(), "Resolved execution order");
    Ok(order)
}

fn status(
    config: &PlinthConfig,
    environment: &Environment,
    graph: &ValidatedGraph,
    order: &[UnitHandle],
) -> Result<Vec<UnitStatus>> {
    let accounts = config.named_accounts(environment)?;
    let mut store = FileStore::open(&config.outdata, &environment.name)?;
    let chain = InMemoryChain::new();

    let statuses =
        ExecutionEngine::new(graph, &mut store, &chain, &accounts, environment).status(order)?;
    Ok(statuses)
}

async fn deploy(
    config: &PlinthConfig,
    environment: &Environment,
    graph: &ValidatedGraph,
    order: &[UnitHandle],
) -> Result<RunReport> {
    if environment.live {
        anyhow::bail!(
            "environment `{}` is live and no network client is available to this binary; \
             embed plinth-deploy with a ChainClient for live deployments",
            environment.name
        );
    }

    let accounts = config.named_accounts(environment)?;
    let mut store = FileStore::open(&config.outdata, &environment.name)?;
    let chain_state = config.chain_state_path(&environment.name);
    let chain = InMemoryChain::open(&chain_state)
        .with_context(|| format!("Failed to open local chain for `{}`", environment.name))?;

    tracing::info!(
        environment = %environment.name,
        outdata = %config.outdata.display(),
        chain_state = %chain_state.display(),
        "Deploying..."
    );

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current step");
            handle.cancel();
        }
    });

    let report = ExecutionEngine::new(graph, &mut store, &chain, &accounts, environment)
        .with_retry(config.retry)
        .with_cancel(signal)
        .run(order)
        .await?;

    Ok(report)
}

/// Map a failure to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    let deploy_error = err
        .downcast_ref::<RunFailure>()
        .map(|failure| &failure.error)
        .or_else(|| err.downcast_ref::<DeployError>());

    match deploy_error {
        Some(DeployError::Cancelled) => EXIT_CANCELLED,
        Some(error) if error.is_preflight() => EXIT_PREFLIGHT,
        Some(_) => EXIT_EXECUTION,
        // Configuration, plan loading and validation.
        None => EXIT_PREFLIGHT,
    }
}

fn order_table(graph: &ValidatedGraph, order: &[UnitHandle]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["#", "Unit", "Depends on", "Actions"]);
    for (position, &handle) in order.iter().enumerate() {
        let unit = graph.unit(handle);
        let dependencies: Vec<_> = unit.dependencies().iter().map(|id| id.as_str()).collect();
        table.add_row(vec![
            (position + 1).to_string(),
            unit.id().to_string(),
            dependencies.join(", "),
            unit.actions().len().to_string(),
        ]);
    }
    table
}

fn status_table(statuses: &[UnitStatus]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Unit", "State", "Address", "Actions"]);
    for status in statuses {
        table.add_row(vec![
            status.unit.to_string(),
            status.state.to_string(),
            status
                .address
                .map(|address| address.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format!("{}/{}", status.actions_recorded, status.actions_total),
        ]);
    }
    table
}

fn report_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Unit", "Outcome", "Address", "Applied", "Skipped", "Changed"]);
    for unit in &report.units {
        table.add_row(vec![
            unit.unit.to_string(),
            unit.outcome.to_string(),
            unit.address.to_string(),
            unit.actions.applied.to_string(),
            unit.actions.skipped.to_string(),
            unit.actions.changed.to_string(),
        ]);
    }
    table
}
