//! Durable sinks for canonical posts, behind a single `PostStorage` contract.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ieh_core::{ErrorKind, Post};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod relational;
pub mod sheets;

pub use relational::RelationalSink;
pub use sheets::{
    GoogleSheetsClient, GoogleSheetsConfig, InMemorySheet, SheetBackend, SheetError, SheetsAuth, SheetsSink,
};

pub const CRATE_NAME: &str = "ieh-storage";

/// Rows fetched per `list_page` call when walking a sink.
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Sheets,
    Relational,
    Memory,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkKind::Sheets => "sheets",
            SinkKind::Relational => "relational",
            SinkKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Updated,
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{sink}: schema initialization failed: {detail}")]
    SchemaInit { sink: &'static str, detail: String },
    #[error("{sink}: write failed: {detail}")]
    Write {
        sink: &'static str,
        detail: String,
        retryable: bool,
    },
    #[error("{sink}: read failed: {detail}")]
    Read { sink: &'static str, detail: String },
    #[error("{sink}: appended row for {source_url} did not read back")]
    Verification { sink: &'static str, source_url: String },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::SchemaInit { .. } => ErrorKind::SchemaInitError,
            _ => ErrorKind::SinkWriteError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Write { retryable, .. } => *retryable,
            StorageError::SchemaInit { .. } => false,
            StorageError::Read { .. } | StorageError::Verification { .. } => true,
        }
    }
}

/// One page of a sink listing. `next_offset` is `None` once the listing is exhausted.
#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub next_offset: Option<usize>,
}

/// Uniform append/lookup contract over a durable sink.
///
/// `append` must be idempotent on `source_url`: repeating it never yields a
/// second durable row.
#[async_trait]
pub trait PostStorage: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Creates backing structures if absent. Called once before the first write; idempotent.
    async fn ensure_schema(&self) -> Result<(), StorageError>;

    async fn append(&self, post: &Post) -> Result<AppendOutcome, StorageError>;

    async fn exists(&self, source_url: &str) -> Result<bool, StorageError>;

    /// Stable-ordered slice of stored records for the current snapshot.
    async fn list_page(&self, offset: usize, limit: usize) -> Result<PostPage, StorageError>;
}

/// Restartable, lazy walk over every record of a sink.
pub struct PostCursor<'a> {
    storage: &'a dyn PostStorage,
    page_size: usize,
    next_offset: Option<usize>,
}

impl<'a> PostCursor<'a> {
    pub fn new(storage: &'a dyn PostStorage, page_size: usize) -> Self {
        Self {
            storage,
            page_size: page_size.max(1),
            next_offset: Some(0),
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Post>>, StorageError> {
        loop {
            let Some(offset) = self.next_offset else {
                return Ok(None);
            };
            let page = self.storage.list_page(offset, self.page_size).await?;
            self.next_offset = page.next_offset;
            if !page.posts.is_empty() {
                return Ok(Some(page.posts));
            }
        }
    }
}

pub fn list_all(storage: &dyn PostStorage) -> PostCursor<'_> {
    PostCursor::new(storage, DEFAULT_PAGE_SIZE)
}

/// In-process sink keyed by `source_url` with upsert semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, Post>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Post> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl PostStorage for MemoryStore {
    fn kind(&self) -> SinkKind {
        SinkKind::Memory
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn append(&self, post: &Post) -> Result<AppendOutcome, StorageError> {
        let mut rows = self.rows.lock().await;
        match rows.insert(post.source_url().to_string(), post.clone()) {
            None => Ok(AppendOutcome::Inserted),
            Some(previous) if previous == *post => Ok(AppendOutcome::AlreadyPresent),
            Some(_) => Ok(AppendOutcome::Updated),
        }
    }

    async fn exists(&self, source_url: &str) -> Result<bool, StorageError> {
        Ok(self.rows.lock().await.contains_key(source_url))
    }

    async fn list_page(&self, offset: usize, limit: usize) -> Result<PostPage, StorageError> {
        let rows = self.rows.lock().await;
        let posts = rows.values().skip(offset).take(limit).cloned().collect::<Vec<_>>();
        let consumed = offset + posts.len();
        Ok(PostPage {
            next_offset: (consumed < rows.len()).then_some(consumed),
            posts,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded attempt counter with capped exponential delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the failed attempt `attempt_index` (0-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}
