use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "judgelet")]
#[clap(
    version,
    about = "Resource-bounded interactive execution harness for untrusted programs"
)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "JUDGELET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one execution request and print its verdict
    Run(RunArgs),

    /// List sandbox backends and whether they can be used here
    Backends,

    /// Initialize a new judgelet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Execution request JSON file, or "-" for stdin
    pub request: PathBuf,

    /// Override the configured sandbox backend
    #[clap(long, short = 'b', value_enum)]
    pub backend: Option<BackendType>,

    /// Override the per-round time limit (milliseconds)
    #[clap(long)]
    pub time_limit: Option<u64>,

    /// Override the total time limit (milliseconds)
    #[clap(long)]
    pub total_time_limit: Option<u64>,

    /// Override the memory limit (bytes)
    #[clap(long)]
    pub memory_limit: Option<u64>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
