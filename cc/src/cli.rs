//! CLI argument parsing for cardstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cc")]
#[command(author, version, about = "Context-card store", long_about = None)]
pub struct Cli {
    /// Path to the card database (default: ./helmsman-cards.db)
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List cards for a session
    List {
        #[arg(required = true)]
        session_id: String,
    },

    /// Count stored cards
    Count,
}
