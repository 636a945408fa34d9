use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shiftwatch_core::RawMessage;
use shiftwatch_sync::{CriteriaMatcher, WatchConfig};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shiftwatch")]
#[command(about = "Watch a labeled inbox for shifts worth taking")]
struct Cli {
    /// YAML or JSON config file (defaults to ./shiftwatch.yaml when present)
    #[arg(long, global = true, env = "SHIFTWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the inbox once and report matching shifts
    Scan,
    /// Rescan on the configured cron schedule until Ctrl-C
    Watch,
    /// Extract and match a single subject/body pair
    Check {
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shiftwatch=info,shiftwatch_sync=info,shiftwatch_extract=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env(cli.config.as_deref()).context("loading configuration")?;
    debug!(?config, "configuration loaded");

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => {
            let summary = shiftwatch_sync::run_scan_once(config).await?;
            println!(
                "scan complete: run_id={} processed={} unparsed={} matched={} reports={}",
                summary.run_id,
                summary.processed,
                summary.unparsed,
                summary.matched,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Watch => shiftwatch_sync::run_watch(config).await?,
        Commands::Check { subject, body } => {
            let message = RawMessage {
                id: "cli".to_string(),
                subject,
                body,
                ..Default::default()
            };
            let extractor = config.extractor();
            match extractor.parse_message(&message) {
                Ok(shift) => {
                    println!("{}", serde_json::to_string_pretty(&shift)?);
                    let decision = CriteriaMatcher::new(config.criteria()).decide(&shift);
                    if decision.matches {
                        println!("match: {}", decision.reason());
                    } else {
                        println!("no match");
                    }
                }
                Err(err) => println!("{err}"),
            }
        }
    }

    Ok(())
}
