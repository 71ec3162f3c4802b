//! Copies every post from one sink into another, skipping keys the target already has.

use std::time::Duration;

use ieh_core::ErrorKind;
use ieh_storage::{BackoffPolicy, PostCursor, PostStorage, StorageError, DEFAULT_PAGE_SIZE};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::ingest::append_with_retry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("preparing destination: {0}")]
    Schema(#[source] StorageError),
    #[error("reading source after {migrated} migrated: {source}")]
    Read {
        migrated: usize,
        #[source]
        source: StorageError,
    },
    #[error("writing {source_url} after {migrated} migrated: {source}")]
    Write {
        source_url: String,
        migrated: usize,
        #[source]
        source: StorageError,
    },
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Schema(err) => err.kind(),
            MigrationError::Read { .. } | MigrationError::Write { .. } => ErrorKind::SinkWriteError,
        }
    }
}

/// Never writes to the source. Interrupted runs are resumed by running again.
#[derive(Debug, Clone, Copy)]
pub struct MigrationController {
    backoff: BackoffPolicy,
    write_timeout: Duration,
    page_size: usize,
}

impl Default for MigrationController {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Duration::from_secs(20))
    }
}

impl MigrationController {
    pub fn new(backoff: BackoffPolicy, write_timeout: Duration) -> Self {
        Self {
            backoff,
            write_timeout,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn migrate(&self, from: &dyn PostStorage, to: &dyn PostStorage) -> Result<MigrationSummary, MigrationError> {
        let span = info_span!("migrate", from = from.kind().as_str(), to = to.kind().as_str());
        async move {
            to.ensure_schema().await.map_err(MigrationError::Schema)?;

            let mut summary = MigrationSummary::default();
            let mut cursor = PostCursor::new(from, self.page_size);
            loop {
                let page = cursor.next_page().await.map_err(|source| MigrationError::Read {
                    migrated: summary.migrated,
                    source,
                })?;
                let Some(page) = page else { break };

                for post in page {
                    let present = to.exists(post.source_url()).await.map_err(|source| MigrationError::Read {
                        migrated: summary.migrated,
                        source,
                    })?;
                    if present {
                        summary.skipped += 1;
                        continue;
                    }
                    append_with_retry(to, &post, self.backoff, self.write_timeout)
                        .await
                        .map_err(|source| MigrationError::Write {
                            source_url: post.source_url().to_string(),
                            migrated: summary.migrated,
                            source,
                        })?;
                    debug!(source_url = post.source_url(), "migrated");
                    summary.migrated += 1;
                }
            }

            info!(migrated = summary.migrated, skipped = summary.skipped, "migration finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
