use clap::Parser;
use colored::*;
use eyre::Result;

use logstore::cli::{Cli, Command};
use logstore::{LogRecord, LogStore};

fn print_records(records: &[LogRecord], json: bool) -> Result<()> {
    for rec in records {
        if json {
            println!("{}", serde_json::to_string(rec)?);
        } else {
            let mut text: String = rec.content_text().chars().take(100).collect();
            if text.len() < rec.content_text().len() {
                text.push_str("...");
            }
            println!(
                "{} {} {} {}",
                rec.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                rec.node_type.as_str().yellow(),
                rec.phase_name.as_deref().unwrap_or("-").cyan(),
                text.replace('\n', " ")
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(|| "helmsman-logs.db".into());
    let store = LogStore::open(&db)?;

    match cli.command {
        Command::Query { filter, json } => {
            let records = store.query_where(&filter)?;
            print_records(&records, json)?;
            eprintln!("{} {} record(s)", "✓".green(), records.len());
        }
        Command::Session { session_id, json } => {
            let records = store.session_records(&session_id)?;
            print_records(&records, json)?;
        }
        Command::Count => {
            println!("{}", store.count()?);
        }
    }

    Ok(())
}
