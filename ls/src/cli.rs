//! CLI argument parsing for logstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ls")]
#[command(author, version, about = "Unified structured log store", long_about = None)]
pub struct Cli {
    /// Path to the log database (default: ./helmsman-logs.db)
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Query records with a SQL WHERE fragment
    Query {
        /// WHERE fragment, e.g. "session_id = 'abc' AND node_type = 'turn'"
        #[arg(required = true)]
        filter: String,

        /// Print full record JSON instead of the one-line summary
        #[arg(long)]
        json: bool,
    },

    /// Show all records for a session
    Session {
        #[arg(required = true)]
        session_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Count stored records
    Count,
}
