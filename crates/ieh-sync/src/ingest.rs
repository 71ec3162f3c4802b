//! Per-target ingestion: paced fetches, normalization and sink fan-out.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ieh_core::{normalize, ErrorKind, Post, RawPost};
use ieh_source::{FetchRequest, Fetched, PostSource, SourceError, Target};
use ieh_storage::{AppendOutcome, BackoffPolicy, PostStorage, SinkKind, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pacing::RateLimiter;
use crate::proxy::ProxyManager;

#[derive(Debug, Clone, Copy)]
pub struct IngestPolicy {
    pub fetch_backoff: BackoffPolicy,
    pub sink_backoff: BackoffPolicy,
    pub fetch_timeout: Duration,
    pub sink_timeout: Duration,
    /// Cool-down applied to an identity after a throttle or transport failure.
    pub throttle_cooldown: Duration,
    pub max_posts_per_target: usize,
    pub workers: usize,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            fetch_backoff: BackoffPolicy {
                max_attempts: 4,
                ..BackoffPolicy::default()
            },
            sink_backoff: BackoffPolicy::default(),
            fetch_timeout: Duration::from_secs(30),
            sink_timeout: Duration::from_secs(20),
            throttle_cooldown: Duration::from_secs(60),
            max_posts_per_target: 20,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Fetching,
    Writing,
    Done,
    Failed,
}

/// A post-level problem recorded in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ItemIssue {
    pub target: String,
    pub position: usize,
    pub source_url: Option<String>,
    pub kind: ErrorKind,
    pub detail: String,
    pub written_to: Vec<SinkKind>,
    pub failed_sinks: Vec<SinkKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    pub state: TargetState,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl TargetOutcome {
    fn new(target: &Target) -> Self {
        Self {
            target: target.to_string(),
            state: TargetState::Pending,
            written: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors_by_kind: BTreeMap<ErrorKind, usize>,
    pub targets: Vec<TargetOutcome>,
    pub issues: Vec<ItemIssue>,
    pub cancelled: bool,
}

impl RunSummary {
    /// True when some target failed without writing anything; drives the CLI exit code.
    pub fn has_unproductive_failures(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.state == TargetState::Failed && t.written == 0)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no sinks configured")]
    NoSinks,
    #[error(transparent)]
    SchemaInit(StorageError),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SchemaInitError
    }
}

#[derive(Debug)]
struct TargetReport {
    outcome: TargetOutcome,
    issues: Vec<ItemIssue>,
    target_error: Option<ErrorKind>,
    cancelled: bool,
}

impl TargetReport {
    fn untouched(target: &Target) -> Self {
        Self {
            outcome: TargetOutcome::new(target),
            issues: Vec::new(),
            target_error: None,
            cancelled: false,
        }
    }
}

enum FetchStep {
    Post(RawPost),
    End,
    ItemFailed { kind: ErrorKind, detail: String },
    TargetFailed { kind: ErrorKind, detail: String },
    Cancelled,
}

struct FanOutFailure {
    written_to: Vec<SinkKind>,
    failed_sinks: Vec<SinkKind>,
    detail: String,
}

/// Drives targets through fetch, normalize and write. Cheap to clone; every
/// clone shares the same source, sinks, limiter and proxy pool.
#[derive(Clone)]
pub struct IngestionController {
    source: Arc<dyn PostSource>,
    sinks: Vec<Arc<dyn PostStorage>>,
    limiter: Arc<RateLimiter>,
    proxies: Arc<ProxyManager>,
    policy: IngestPolicy,
    cancel: watch::Receiver<bool>,
}

impl IngestionController {
    pub fn new(
        source: Arc<dyn PostSource>,
        sinks: Vec<Arc<dyn PostStorage>>,
        limiter: Arc<RateLimiter>,
        proxies: Arc<ProxyManager>,
        policy: IngestPolicy,
    ) -> Self {
        let (_never, cancel) = watch::channel(false);
        Self {
            source,
            sinks,
            limiter,
            proxies,
            policy,
            cancel,
        }
    }

    /// Stops new fetches once the channel carries `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub async fn run(&self, targets: &[Target]) -> Result<RunSummary, IngestError> {
        if self.sinks.is_empty() {
            return Err(IngestError::NoSinks);
        }
        for sink in &self.sinks {
            sink.ensure_schema().await.map_err(IngestError::SchemaInit)?;
            debug!(sink = sink.kind().as_str(), "schema ready");
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, targets = targets.len(), workers = self.policy.workers, source = self.source.source_id(), "ingest run started");

        let reports = if self.policy.workers <= 1 || targets.len() <= 1 {
            let mut reports = Vec::with_capacity(targets.len());
            for target in targets {
                if self.is_cancelled() {
                    reports.push(TargetReport::untouched(target));
                    continue;
                }
                reports.push(self.run_target(target.clone()).await);
            }
            reports
        } else {
            self.run_pool(targets).await
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            written: 0,
            skipped: 0,
            failed: 0,
            errors_by_kind: BTreeMap::new(),
            targets: Vec::with_capacity(reports.len()),
            issues: Vec::new(),
            cancelled: self.is_cancelled(),
        };
        for report in reports {
            summary.written += report.outcome.written;
            summary.skipped += report.outcome.skipped;
            summary.failed += report.outcome.failed;
            summary.cancelled |= report.cancelled;
            for issue in &report.issues {
                *summary.errors_by_kind.entry(issue.kind).or_default() += 1;
            }
            if let Some(kind) = report.target_error {
                *summary.errors_by_kind.entry(kind).or_default() += 1;
            }
            summary.issues.extend(report.issues);
            summary.targets.push(report.outcome);
        }

        info!(
            %run_id,
            written = summary.written,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn run_pool(&self, targets: &[Target]) -> Vec<TargetReport> {
        let semaphore = Arc::new(Semaphore::new(self.policy.workers));
        let mut set = JoinSet::new();
        for (idx, target) in targets.iter().cloned().enumerate() {
            let controller = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if controller.is_cancelled() {
                    return (idx, TargetReport::untouched(&target));
                }
                (idx, controller.run_target(target).await)
            });
        }

        let mut reports: Vec<TargetReport> = targets.iter().map(TargetReport::untouched).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, report)) => reports[idx] = report,
                Err(err) => error!(error = %err, "target worker aborted"),
            }
        }
        reports
    }

    async fn run_target(&self, target: Target) -> TargetReport {
        let span = info_span!("target", target = %target);
        async move {
            let mut report = TargetReport::untouched(&target);
            let outcome = &mut report.outcome;
            outcome.state = TargetState::Fetching;
            info!("target fetching");

            let mut position = 0;
            while position < self.policy.max_posts_per_target {
                if self.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                match self.fetch_with_retry(&target, position).await {
                    FetchStep::Post(raw) => {
                        outcome.state = TargetState::Writing;
                        let key = raw.display_key();
                        match normalize(&raw, Utc::now()) {
                            Err(err) => {
                                warn!(position, source_url = %key, error = %err, "skipping malformed post");
                                outcome.skipped += 1;
                                report.issues.push(ItemIssue {
                                    target: target.to_string(),
                                    position,
                                    source_url: Some(key),
                                    kind: err.kind(),
                                    detail: err.to_string(),
                                    written_to: Vec::new(),
                                    failed_sinks: Vec::new(),
                                });
                            }
                            Ok(post) => match self.fan_out(&post).await {
                                Ok(sinks) => {
                                    debug!(position, source_url = post.source_url(), sinks = sinks.len(), "post written");
                                    outcome.written += 1;
                                }
                                Err(failure) => {
                                    warn!(
                                        position,
                                        source_url = post.source_url(),
                                        detail = %failure.detail,
                                        "post not written to every sink"
                                    );
                                    outcome.failed += 1;
                                    report.issues.push(ItemIssue {
                                        target: target.to_string(),
                                        position,
                                        source_url: Some(post.source_url().to_string()),
                                        kind: ErrorKind::SinkWriteError,
                                        detail: failure.detail,
                                        written_to: failure.written_to,
                                        failed_sinks: failure.failed_sinks,
                                    });
                                }
                            },
                        }
                        outcome.state = TargetState::Fetching;
                        position += 1;
                    }
                    FetchStep::End => {
                        debug!(position, "end of target");
                        break;
                    }
                    FetchStep::ItemFailed { kind, detail } => {
                        warn!(position, kind = %kind, detail = %detail, "fetch attempts exhausted; moving on");
                        outcome.failed += 1;
                        report.issues.push(ItemIssue {
                            target: target.to_string(),
                            position,
                            source_url: None,
                            kind,
                            detail,
                            written_to: Vec::new(),
                            failed_sinks: Vec::new(),
                        });
                        position += 1;
                    }
                    FetchStep::TargetFailed { kind, detail } => {
                        warn!(position, kind = %kind, detail = %detail, "target failed");
                        outcome.error = Some(detail);
                        report.target_error = Some(kind);
                        break;
                    }
                    FetchStep::Cancelled => {
                        report.cancelled = true;
                        break;
                    }
                }
            }

            outcome.state = if report.target_error.is_some() || (outcome.failed > 0 && outcome.written == 0) {
                TargetState::Failed
            } else {
                TargetState::Done
            };
            info!(
                state = ?outcome.state,
                written = outcome.written,
                skipped = outcome.skipped,
                failed = outcome.failed,
                "target finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Resolves `None` if cancellation is signalled before `fut` completes.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            Ok(_) = cancel.wait_for(|c| *c) => None,
            out = fut => Some(out),
        }
    }

    async fn fetch_with_retry(&self, target: &Target, position: usize) -> FetchStep {
        let backoff = self.policy.fetch_backoff;
        let mut last_error = SourceError::Transport("no attempt made".into());

        for attempt in 0..backoff.attempts() {
            if attempt > 0 {
                let delay = backoff.delay_for_attempt(attempt - 1);
                if self.until_cancelled(sleep(delay)).await.is_none() {
                    return FetchStep::Cancelled;
                }
            }
            if self.until_cancelled(self.limiter.acquire()).await.is_none() {
                return FetchStep::Cancelled;
            }
            let identity = match self.proxies.lease_identity().await {
                Ok(identity) => identity,
                Err(err) => {
                    return FetchStep::TargetFailed {
                        kind: err.kind(),
                        detail: err.to_string(),
                    }
                }
            };

            let request = FetchRequest {
                target,
                position,
                identity: &identity,
            };
            let started = Instant::now();
            let result = timeout(self.policy.fetch_timeout, self.source.fetch_next(request)).await;
            self.proxies.observe_latency(&identity, started.elapsed()).await;

            let err = match result {
                Ok(Ok(fetched)) => {
                    self.limiter.report_success();
                    self.proxies.mark_healthy(&identity).await;
                    return match fetched {
                        Fetched::Post(raw) => FetchStep::Post(raw),
                        Fetched::EndOfTarget => FetchStep::End,
                    };
                }
                Ok(Err(err @ SourceError::PrivateOrUnavailable { .. })) => {
                    return FetchStep::TargetFailed {
                        kind: err.kind(),
                        detail: err.to_string(),
                    };
                }
                Ok(Err(SourceError::Throttled { retry_after })) => {
                    self.limiter.report_throttled();
                    let cool_down = retry_after.unwrap_or(self.policy.throttle_cooldown);
                    self.proxies.mark_failed(&identity, cool_down).await;
                    SourceError::Throttled { retry_after }
                }
                Ok(Err(err)) => {
                    self.proxies.mark_failed(&identity, self.policy.throttle_cooldown).await;
                    err
                }
                Err(_) => {
                    self.proxies.mark_failed(&identity, self.policy.throttle_cooldown).await;
                    SourceError::Transport(format!("fetch timed out after {:?}", self.policy.fetch_timeout))
                }
            };
            warn!(position, attempt, identity = %identity, error = %err, "fetch attempt failed");
            last_error = err;
        }

        FetchStep::ItemFailed {
            kind: last_error.kind(),
            detail: last_error.to_string(),
        }
    }

    /// Writes to every sink; each sink gets its own retry budget. Runs to
    /// completion even when cancellation is signalled mid-way.
    async fn fan_out(&self, post: &Post) -> Result<Vec<SinkKind>, FanOutFailure> {
        let mut written_to = Vec::with_capacity(self.sinks.len());
        let mut failed_sinks = Vec::new();
        let mut details = Vec::new();

        for sink in &self.sinks {
            let kind = sink.kind();
            let span = info_span!("sink", sink = kind.as_str());
            match append_with_retry(sink.as_ref(), post, self.policy.sink_backoff, self.policy.sink_timeout)
                .instrument(span)
                .await
            {
                Ok(_) => written_to.push(kind),
                Err(err) => {
                    failed_sinks.push(kind);
                    details.push(err.to_string());
                }
            }
        }

        if failed_sinks.is_empty() {
            Ok(written_to)
        } else {
            Err(FanOutFailure {
                written_to,
                failed_sinks,
                detail: details.join("; "),
            })
        }
    }
}

/// Appends with bounded retries; non-retryable errors end the loop at once.
pub(crate) async fn append_with_retry(
    sink: &dyn PostStorage,
    post: &Post,
    backoff: BackoffPolicy,
    per_call_timeout: Duration,
) -> Result<AppendOutcome, StorageError> {
    let mut attempt = 0;
    loop {
        let result = match timeout(per_call_timeout, sink.append(post)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Write {
                sink: sink.kind().as_str(),
                detail: format!("timed out after {per_call_timeout:?}"),
                retryable: true,
            }),
        };
        match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && attempt + 1 < backoff.attempts() => {
                warn!(attempt, source_url = post.source_url(), error = %err, "sink write failed; retrying");
                sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
