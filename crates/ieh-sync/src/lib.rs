//! Run orchestration: configuration, pacing, proxy rotation, ingestion and migration.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ieh_source::FixtureSource;
use ieh_storage::{
    GoogleSheetsClient, MemoryStore, PostStorage, RelationalSink, SheetsSink, SinkKind,
};
use tokio::sync::watch;
use tracing::info;

pub mod config;
pub mod ingest;
pub mod migrate;
pub mod pacing;
pub mod proxy;

pub use config::{ConfigError, HarvestConfig, SheetsSettings};
pub use ieh_source::{EgressIdentity, Target};
pub use ingest::{
    IngestError, IngestPolicy, IngestionController, ItemIssue, RunSummary, TargetOutcome, TargetState,
};
pub use migrate::{MigrationController, MigrationError, MigrationSummary};
pub use pacing::{RateLimiter, RateLimiterConfig};
pub use proxy::{load_proxy_list, parse_proxy_list, ProxyDiagnostic, ProxyError, ProxyManager};

pub const CRATE_NAME: &str = "ieh-sync";

/// Sinks opened for one run. The relational pool is tracked separately so it
/// can be closed when the run ends.
pub struct SinkSet {
    sinks: Vec<Arc<dyn PostStorage>>,
    relational: Option<Arc<RelationalSink>>,
}

impl SinkSet {
    /// Opens `kinds` in `SinkKind` order, so a sheets failure never leaves a pool behind.
    pub async fn open(config: &HarvestConfig, kinds: &BTreeSet<SinkKind>) -> Result<Self> {
        let mut set = Self {
            sinks: Vec::with_capacity(kinds.len()),
            relational: None,
        };
        for kind in kinds {
            match kind {
                SinkKind::Sheets => {
                    let client_config = config
                        .google_sheets_config()
                        .context("configuring sheets credentials")?;
                    let client = GoogleSheetsClient::new(client_config).context("building sheets client")?;
                    set.sinks.push(Arc::new(SheetsSink::new(Arc::new(client))));
                }
                SinkKind::Relational => {
                    let url = config
                        .relational_connection_string
                        .as_deref()
                        .context("relational sink needs relational_connection_string or DATABASE_URL")?;
                    let sink = Arc::new(
                        RelationalSink::connect(url, Duration::from_secs(config.sink_timeout_secs))
                            .await
                            .context("connecting to relational store")?,
                    );
                    set.relational = Some(sink.clone());
                    set.sinks.push(sink);
                }
                SinkKind::Memory => set.sinks.push(Arc::new(MemoryStore::new())),
            }
            info!(sink = kind.as_str(), "sink opened");
        }
        Ok(set)
    }

    pub fn in_memory() -> Self {
        Self {
            sinks: vec![Arc::new(MemoryStore::new())],
            relational: None,
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn PostStorage>> {
        self.sinks.clone()
    }

    pub fn get(&self, kind: SinkKind) -> Option<Arc<dyn PostStorage>> {
        self.sinks.iter().find(|s| s.kind() == kind).cloned()
    }

    pub async fn close(self) {
        if let Some(relational) = self.relational {
            relational.close().await;
        }
    }
}

/// Pool from `proxy_list` plus the entries of `proxy_list_file`, if any.
pub async fn build_proxy_manager(config: &HarvestConfig) -> Result<ProxyManager> {
    let mut urls = config.proxy_list.clone();
    if let Some(path) = &config.proxy_list_file {
        urls.extend(
            load_proxy_list(path)
                .await
                .with_context(|| format!("reading proxy list {}", path.display()))?,
        );
    }
    Ok(ProxyManager::new(urls, config.direct_fallback))
}

/// One ingestion pass over the configured targets. With `dry_run`, posts go to
/// an in-memory store instead of the configured sinks.
pub async fn run_ingest(
    config: &HarvestConfig,
    proxies: Arc<ProxyManager>,
    dry_run: bool,
    cancel: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let targets = config.parsed_targets();
    if targets.is_empty() {
        bail!("no targets configured (set `targets` or IEH_TARGETS)");
    }

    let sinks = if dry_run {
        SinkSet::in_memory()
    } else {
        SinkSet::open(config, &config.sinks).await?
    };
    let controller = IngestionController::new(
        Arc::new(FixtureSource::new(&config.fixtures_dir)),
        sinks.all(),
        Arc::new(RateLimiter::new(config.rate_limiter_config())),
        proxies,
        config.ingest_policy(),
    )
    .with_cancellation(cancel);

    let result = controller.run(&targets).await;
    sinks.close().await;
    result.context("ingest run aborted")
}

/// Copies posts from the `from` sink into the `to` sink.
pub async fn run_migration(config: &HarvestConfig, from: SinkKind, to: SinkKind) -> Result<MigrationSummary> {
    if from == to {
        bail!("migration source and destination are both {}", from.as_str());
    }
    if from == SinkKind::Memory || to == SinkKind::Memory {
        bail!("the memory sink does not persist and cannot take part in a migration");
    }

    let kinds = BTreeSet::from([from, to]);
    HarvestConfig {
        sinks: kinds.clone(),
        ..config.clone()
    }
    .validate()
    .context("migration settings")?;

    let sinks = SinkSet::open(config, &kinds).await?;
    let result = match (sinks.get(from), sinks.get(to)) {
        (Some(source), Some(destination)) => {
            let policy = config.ingest_policy();
            MigrationController::new(policy.sink_backoff, policy.sink_timeout)
                .migrate(source.as_ref(), destination.as_ref())
                .await
                .with_context(|| format!("migrating {} -> {}", from.as_str(), to.as_str()))
        }
        _ => Err(anyhow::anyhow!("sink set is missing {} or {}", from.as_str(), to.as_str())),
    };
    sinks.close().await;
    result
}
