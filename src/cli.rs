use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dirsync")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative group and membership sync for directory services", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to ~/.config/dirsync/config.toml)
    #[arg(long, global = true, env = "DIRSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change, without writing anything
    Plan {
        /// Only plan this group (by email)
        #[arg(short, long)]
        group: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Converge groups and memberships to the configuration
    Apply(ApplyArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, clap::Args)]
pub struct ApplyArgs {
    /// Only apply this group (by email)
    #[arg(short, long)]
    pub group: Option<String>,

    /// Skip confirmation prompts
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would be done without making changes
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the resolved config location and contents
    Show,
}
