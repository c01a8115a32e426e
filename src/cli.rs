use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tock",
    about = "Persistent terminal workstation runtime for model agents"
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a new agent instance — clone a repo or register a path
    Init {
        /// Git repository URL to clone
        url: Option<String>,

        /// Register an existing directory (no clone)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Instance name (default: derived from URL or directory)
        #[arg(short, long)]
        name: Option<String>,

        /// Git branch to checkout (clone mode only)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Run a single agent tick
    Tick {
        /// Instance name
        name: String,
    },

    /// Watch for triggers and auto-tick
    Watch {
        /// Instance name
        name: String,

        /// Poll interval in seconds
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },

    /// List registered instances
    List,

    /// Unregister an instance (data directory is left in place)
    Remove {
        /// Instance name
        name: String,
    },

    /// Install a systemd user service running the watcher
    Install {
        /// Instance name
        name: String,
    },

    /// Remove the systemd user service
    Uninstall {
        /// Instance name
        name: String,
    },
}
