use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ieh_storage::SinkKind;
use ieh_sync::{HarvestConfig, RunSummary};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ieh")]
#[command(about = "Instagram engagement harvester")]
struct Cli {
    /// YAML configuration file (defaults to ./ieh.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every configured target into the configured sinks.
    Ingest {
        /// Write into an in-memory store instead of the configured sinks.
        #[arg(long)]
        dry_run: bool,
        /// Also serve the diagnostic API on this port while the run lasts.
        #[arg(long)]
        diagnostics_port: Option<u16>,
    },
    /// Copy posts between durable sinks, skipping ones already present.
    Migrate {
        #[arg(long, value_enum)]
        from: DurableSink,
        #[arg(long, value_enum)]
        to: DurableSink,
    },
    /// Serve the proxy diagnostic API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DurableSink {
    Sheets,
    Relational,
}

impl From<DurableSink> for SinkKind {
    fn from(value: DurableSink) -> Self {
        match value {
            DurableSink::Sheets => SinkKind::Sheets,
            DurableSink::Relational => SinkKind::Relational,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ieh=info,warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Flips the returned channel to `true` on Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight writes");
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingest complete: run_id={} written={} skipped={} failed={} cancelled={}",
        summary.run_id, summary.written, summary.skipped, summary.failed, summary.cancelled
    );
    for target in &summary.targets {
        println!(
            "  {:<24} {:?} written={} skipped={} failed={}{}",
            target.target,
            target.state,
            target.written,
            target.skipped,
            target.failed,
            target.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default()
        );
    }
    for (kind, count) in &summary.errors_by_kind {
        println!("  errors[{kind}]={count}");
    }
}

async fn ingest(config: HarvestConfig, dry_run: bool, diagnostics_port: Option<u16>) -> Result<ExitCode> {
    let checked = if dry_run {
        HarvestConfig {
            sinks: BTreeSet::from([SinkKind::Memory]),
            ..config.clone()
        }
    } else {
        config.clone()
    };
    checked.validate().context("invalid configuration")?;
    let proxies = Arc::new(ieh_sync::build_proxy_manager(&config).await?);

    let (web_stop, web_stop_rx) = watch::channel(false);
    let web = diagnostics_port.map(|port| {
        let state = ieh_web::AppState::new(proxies.clone());
        tokio::spawn(ieh_web::serve(state, port, web_stop_rx))
    });

    let result = ieh_sync::run_ingest(&config, proxies, dry_run, cancel_on_ctrl_c()).await;

    let _ = web_stop.send(true);
    if let Some(handle) = web {
        match handle.await {
            Ok(Err(err)) => warn!(error = %err, "diagnostic api stopped with an error"),
            Err(err) => warn!(error = %err, "diagnostic api task failed"),
            Ok(Ok(())) => {}
        }
    }

    let summary = result?;
    print_summary(&summary);
    Ok(if summary.has_unproductive_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let dotenv = dotenvy::dotenv();
    init_tracing(cli.json_logs);
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded .env");
    }

    let config = HarvestConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Ingest {
        dry_run: false,
        diagnostics_port: None,
    }) {
        Commands::Ingest {
            dry_run,
            diagnostics_port,
        } => ingest(config, dry_run, diagnostics_port).await,
        Commands::Migrate { from, to } => {
            let summary = ieh_sync::run_migration(&config, from.into(), to.into()).await?;
            println!(
                "migrate complete: migrated={} skipped={}",
                summary.migrated, summary.skipped
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { port } => {
            let proxies = Arc::new(ieh_sync::build_proxy_manager(&config).await?);
            let port = port.unwrap_or_else(ieh_web::port_from_env);
            ieh_web::serve(ieh_web::AppState::new(proxies), port, cancel_on_ctrl_c()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_is_the_default_command() {
        let cli = Cli::try_parse_from(["ieh", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        assert!(cli.command.is_none());
    }

    #[test]
    fn migrate_takes_durable_sinks_only() {
        let cli = Cli::try_parse_from(["ieh", "migrate", "--from", "sheets", "--to", "relational"]).unwrap();
        match cli.command {
            Some(Commands::Migrate { from, to }) => {
                assert_eq!(SinkKind::from(from), SinkKind::Sheets);
                assert_eq!(SinkKind::from(to), SinkKind::Relational);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["ieh", "migrate", "--from", "memory", "--to", "sheets"]).is_err());
    }
}
