//! Chronicle CLI Module
//! Command-line interface for inspecting a project's audit history

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chronicle")]
#[command(version)]
#[command(about = "Inspect entity snapshots and audit logs", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a config file and an empty audit database
    Init {
        /// Project name
        #[arg(short, long)]
        name: String,
    },

    /// Show audit store counts
    Status,

    /// List the snapshots of one entity, oldest first
    History {
        /// Entity type, e.g. Post
        entity_type: String,

        /// Entity identifier
        entity_id: String,
    },

    /// Print one snapshot with its payload
    Show {
        snapshot_id: String,
    },

    /// Print an audit log and every snapshot it grouped
    Log {
        audit_log_id: String,
    },
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
