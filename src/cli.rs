use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vmstack")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Provision a virtual machine and its network from a declarative config", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "VMSTACK_CONFIG",
        default_value = "vmstack.toml"
    )]
    pub config: PathBuf,

    /// Directory holding state and the local platform inventory
    #[arg(long, global = true, env = "VMSTACK_DIR", default_value = ".vmstack")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Preview what apply would change
    Plan,

    /// Converge the platform to the configuration
    Apply(ApplyArgs),

    /// Show outputs of the last run
    Outputs {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded resource state
    State,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Apply
// ============================================================================

#[derive(Parser)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of resources converged in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Trust recorded state instead of reading live resources first
    #[arg(long)]
    pub no_refresh: bool,

    /// Seconds to wait for another run holding a resource's lock
    #[arg(long, default_value = "30")]
    pub lock_timeout: u64,
}
