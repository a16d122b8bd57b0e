//! CLI argument parsing for the helmsman binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hm")]
#[command(author, version, about = "Cascade orchestration runtime", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cascade to completion
    Run {
        /// Cascade definition (JSON or YAML)
        #[arg(required = true)]
        cascade: PathBuf,

        /// Inputs as key=value pairs (values parsed as JSON, falling back
        /// to strings)
        #[arg(short, long)]
        input: Vec<String>,

        /// Inputs as a single JSON object (overrides --input)
        #[arg(long)]
        input_json: Option<String>,

        /// Reuse a session id instead of generating one
        #[arg(long)]
        session: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a cascade definition without running it
    Validate {
        #[arg(required = true)]
        cascade: PathBuf,
    },

    /// List registered tools
    Tools,
}
