use clap::Parser;
use colored::*;
use eyre::Result;

use cardstore::CardStore;
use cardstore::cli::{Cli, Command};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(|| "helmsman-cards.db".into());
    let store = CardStore::open(&db)?;

    match cli.command {
        Command::List { session_id } => {
            let cards = store.cards_for_session(&session_id)?;
            if cards.is_empty() {
                println!("No cards for session {}", session_id);
            }
            for card in cards {
                println!(
                    "{} {} {} {}",
                    card.created_at.format("%H:%M:%S").to_string().dimmed(),
                    card.role.yellow(),
                    format!("~{}tok", card.estimated_tokens).dimmed(),
                    card.summary
                );
            }
        }
        Command::Count => {
            println!("{}", store.count()?);
        }
    }

    Ok(())
}
