use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// The environment targeted when none is given.
const DEFAULT_ENVIRONMENT: &str = "localhost";

#[derive(Parser)]
#[command(name = "plinth")]
#[command(
    author,
    version,
    about = "Resumable, dependency-ordered smart contract deployments"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(
        short,
        long,
        global = true,
        env = "PLINTH_VERBOSITY",
        default_value_t = LevelFilter::INFO
    )]
    pub verbosity: LevelFilter,

    /// Path to a Plinth.toml file, or to the directory holding it.
    ///
    /// A missing file is not an error: the built-in defaults target a local dev chain.
    #[arg(long, alias = "conf", global = true, env = "PLINTH_CONFIG", default_value = ".")]
    pub config: PathBuf,

    /// The target environment, as configured under `[environments]`.
    #[arg(short, long, global = true, env = "PLINTH_ENV", default_value = DEFAULT_ENVIRONMENT)]
    pub env: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy the selected units and apply their actions, resuming any previous run.
    Deploy(Selection),

    /// Compare the selected units with the recorded artifacts without deploying anything.
    Status(Selection),

    /// Print the execution order of the selected units.
    Order(Selection),
}

/// Which units a command applies to.
#[derive(Debug, Clone, Args)]
pub struct Selection {
    /// Only run units carrying one of these tags, plus their dependencies.
    ///
    /// Accepts a comma-separated list. All units are selected when omitted.
    #[arg(short, long, value_delimiter = ',', env = "PLINTH_TAGS")]
    pub tags: Vec<String>,
}
