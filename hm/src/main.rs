use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::{Value, json};

use helmsman::cascade::{ConfigSource, load_config};
use helmsman::cli::{Cli, Command};
use helmsman::config::Config;
use helmsman::runner::RunOptions;
use helmsman::runtime::Runtime;
use helmsman::tools::init_tools;

fn parse_inputs(pairs: &[String], input_json: Option<&str>) -> Result<Value> {
    if let Some(raw) = input_json {
        return serde_json::from_str(raw).context("--input-json is not valid JSON");
    }
    let mut inputs = serde_json::Map::new();
    for pair in pairs {
        let (key, raw_value) = pair
            .split_once('=')
            .ok_or_else(|| eyre::eyre!("input '{pair}' is not key=value"))?;
        let value = serde_json::from_str(raw_value).unwrap_or_else(|_| json!(raw_value));
        inputs.insert(key.to_string(), value);
    }
    Ok(Value::Object(inputs))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            cascade,
            input,
            input_json,
            session,
            json,
        } => {
            let inputs = parse_inputs(&input, input_json.as_deref())?;
            let runtime = Runtime::initialize(config)?;

            let result = runtime
                .runner
                .run(
                    ConfigSource::Path(cascade),
                    inputs,
                    RunOptions {
                        session_id: session,
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(result) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        let status = if result.status == "success" {
                            result.status.green()
                        } else {
                            result.status.red()
                        };
                        println!("{} session {}", status, result.session_id.cyan());
                        for entry in &result.lineage {
                            println!("  {} {}", "→".dimmed(), entry.phase.yellow());
                        }
                        for error in &result.errors {
                            println!(
                                "  {} {} ({}): {}",
                                "✗".red(),
                                error.phase,
                                error.error_type,
                                error.error_message
                            );
                        }
                        if let Some(value) = &result.result {
                            println!("{}", serde_json::to_string_pretty(value)?);
                        }
                    }
                    runtime.shutdown().await;
                }
                Err(e) => {
                    runtime.shutdown().await;
                    return Err(e);
                }
            }
        }
        Command::Validate { cascade } => {
            let config = load_config(&ConfigSource::Path(cascade))?;
            println!(
                "{} {} ({} phase{})",
                "✓".green(),
                config.cascade_id.cyan(),
                config.phases.len(),
                if config.phases.len() == 1 { "" } else { "s" }
            );
        }
        Command::Tools => {
            let registry = init_tools(&config.tools);
            for (name, description) in registry.catalog() {
                println!("{}  {}", name.cyan(), description.dimmed());
            }
        }
    }

    Ok(())
}
