//! Spreadsheet sink: one row per post, fixed column order, header in row 1.
//! Sheets written before the header existed keep their data from row 1.
//!
//! The sheet itself is append-only, so idempotence comes from an index of
//! `source_url`s built from the existing rows during `ensure_schema`. Every
//! append is confirmed by re-reading the row it landed in, and an append whose
//! outcome is unknown is settled by rescanning the sheet before it is retried.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use ieh_core::{parse_timestamp, MediaType, Post};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    classify_reqwest_error, classify_status, AppendOutcome, PostPage, PostStorage, RetryDisposition,
    SinkKind, StorageError, DEFAULT_PAGE_SIZE,
};

pub const SHEET_COLUMNS: [&str; 7] = [
    "source_url",
    "caption_text",
    "like_count",
    "comment_count",
    "published_at",
    "media_type",
    "captured_at",
];

/// OAuth scope for reading and appending sheet values.
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// First data row when row 1 holds the header.
const FIRST_DATA_ROW: usize = 2;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sheets api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected sheets response: {0}")]
    Decode(String),
    #[error("sheets credentials: {0}")]
    Auth(#[from] gcp_auth::Error),
}

impl SheetError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SheetError::Request(err) => classify_reqwest_error(err),
            SheetError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            SheetError::Decode(_) => RetryDisposition::NonRetryable,
            SheetError::Auth(_) => RetryDisposition::Retryable,
        }
    }
}

/// Row-level access to one worksheet. Row numbers are 1-based, as in the sheet.
#[async_trait]
pub trait SheetBackend: Send + Sync {
    async fn read_rows(&self, first_row: usize, limit: usize) -> Result<Vec<Vec<String>>, SheetError>;

    async fn write_header(&self, header: &[String]) -> Result<(), SheetError>;

    /// Appends after the last non-empty row and returns the row number written.
    async fn append_row(&self, row: Vec<String>) -> Result<usize, SheetError>;
}

/// How the client obtains its bearer token.
#[derive(Clone)]
pub enum SheetsAuth {
    /// Fixed token, used as is until it expires.
    Static(String),
    /// Service-account key; the provider caches tokens and refreshes them before expiry.
    ServiceAccount(Arc<dyn TokenProvider>),
}

impl SheetsAuth {
    pub fn service_account(key_path: &Path) -> Result<Self, SheetError> {
        let account = CustomServiceAccount::from_file(key_path)?;
        Ok(SheetsAuth::ServiceAccount(Arc::new(account)))
    }

    async fn bearer_token(&self) -> Result<String, SheetError> {
        match self {
            SheetsAuth::Static(token) => Ok(token.clone()),
            SheetsAuth::ServiceAccount(provider) => {
                let token = provider.token(&[SHEETS_SCOPE]).await?;
                Ok(token.as_str().to_string())
            }
        }
    }
}

impl fmt::Debug for SheetsAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetsAuth::Static(_) => f.write_str("Static(..)"),
            SheetsAuth::ServiceAccount(_) => f.write_str("ServiceAccount"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub worksheet_name: String,
    pub auth: SheetsAuth,
    pub timeout: Duration,
}

/// Sheets v4 `values` REST client. A token is requested per call, so
/// service-account tokens never go stale mid-run.
#[derive(Debug)]
pub struct GoogleSheetsClient {
    client: reqwest::Client,
    config: GoogleSheetsConfig,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: String,
}

impl GoogleSheetsClient {
    pub fn new(config: GoogleSheetsConfig) -> Result<Self, SheetError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn last_column() -> char {
        (b'A' + (SHEET_COLUMNS.len() as u8 - 1)) as char
    }

    fn range(&self, first_row: usize, last_row: usize) -> String {
        a1_range(
            &self.config.worksheet_name,
            &format!("A{first_row}:{}{last_row}", Self::last_column()),
        )
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, SheetError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|err| SheetError::Decode(format!("invalid api base: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| SheetError::Decode("api base cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.config.spreadsheet_id.as_str(), "values"])
            .push(&format!("{range}{suffix}"));
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Option<serde_json::Value>) -> Result<String, SheetError> {
        let token = self.config.auth.bearer_token().await?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(SheetError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl SheetBackend for GoogleSheetsClient {
    async fn read_rows(&self, first_row: usize, limit: usize) -> Result<Vec<Vec<String>>, SheetError> {
        let last_row = first_row + limit.max(1) - 1;
        let range = self.range(first_row, last_row);
        let url = self.values_url(&range, "")?;
        let text = self.send(Method::GET, url, None).await?;
        let parsed: ValueRange =
            serde_json::from_str(&text).map_err(|err| SheetError::Decode(err.to_string()))?;
        Ok(parsed.values)
    }

    async fn write_header(&self, header: &[String]) -> Result<(), SheetError> {
        let range = self.range(1, 1);
        let mut url = self.values_url(&range, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.send(
            Method::PUT,
            url,
            Some(json!({ "range": range, "majorDimension": "ROWS", "values": [header] })),
        )
        .await?;
        Ok(())
    }

    async fn append_row(&self, row: Vec<String>) -> Result<usize, SheetError> {
        let range = self.range(1, 1);
        let mut url = self.values_url(&range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let text = self
            .send(Method::POST, url, Some(json!({ "majorDimension": "ROWS", "values": [row] })))
            .await?;
        let parsed: AppendResponse =
            serde_json::from_str(&text).map_err(|err| SheetError::Decode(err.to_string()))?;
        parse_row_number(&parsed.updates.updated_range).ok_or_else(|| {
            SheetError::Decode(format!("no row number in range {}", parsed.updates.updated_range))
        })
    }
}

/// Quotes a worksheet name for an A1 range: `'My Sheet'!A1:G1`.
pub fn a1_range(worksheet: &str, cells: &str) -> String {
    format!("'{}'!{cells}", worksheet.replace('\'', "''"))
}

/// A header row starts with the `source_url` column name.
fn is_header_row(row: &[String]) -> bool {
    row.first()
        .is_some_and(|cell| cell.trim().eq_ignore_ascii_case(SHEET_COLUMNS[0]))
}

fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// Extracts the first row number from an A1 range such as `'Posts'!A5:G5`.
pub fn parse_row_number(range: &str) -> Option<usize> {
    let cells = range.rsplit('!').next()?;
    let first = cells.split(':').next()?;
    let digits = first.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    digits.parse().ok()
}

/// Worksheet held in memory; row 1 is `rows[0]`.
#[derive(Debug, Default)]
pub struct InMemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
}

impl InMemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl SheetBackend for InMemorySheet {
    async fn read_rows(&self, first_row: usize, limit: usize) -> Result<Vec<Vec<String>>, SheetError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .skip(first_row.saturating_sub(1))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn write_header(&self, header: &[String]) -> Result<(), SheetError> {
        let mut rows = self.rows.lock().await;
        if rows.is_empty() {
            rows.push(header.to_vec());
        } else {
            rows[0] = header.to_vec();
        }
        Ok(())
    }

    async fn append_row(&self, row: Vec<String>) -> Result<usize, SheetError> {
        let mut rows = self.rows.lock().await;
        rows.push(row);
        Ok(rows.len())
    }
}

#[derive(Debug, Default)]
struct SheetIndex {
    seen: HashSet<String>,
    /// Appends not yet confirmed. `Some(row)` when the sheet reported where the
    /// row landed; `None` when the call failed or was cut off with the outcome unknown.
    in_doubt: HashMap<String, Option<usize>>,
    built: bool,
}

/// `PostStorage` over a worksheet. Assumes it is the only writer of that sheet.
pub struct SheetsSink {
    backend: Arc<dyn SheetBackend>,
    index: Mutex<SheetIndex>,
    /// Row holding the first post: 2 below a header, 1 on a headerless sheet.
    data_start: Mutex<Option<usize>>,
}

impl SheetsSink {
    pub fn new(backend: Arc<dyn SheetBackend>) -> Self {
        Self {
            backend,
            index: Mutex::new(SheetIndex::default()),
            data_start: Mutex::new(None),
        }
    }

    pub async fn index_built(&self) -> bool {
        self.index.lock().await.built
    }

    /// `None` while row 1 is empty, since the layout is not decided yet.
    async fn detect_data_start(&self) -> Result<Option<usize>, SheetError> {
        let first = self.backend.read_rows(1, 1).await?;
        Ok(match first.first() {
            Some(row) if is_header_row(row) => Some(FIRST_DATA_ROW),
            Some(row) if !is_blank_row(row) => Some(1),
            _ => None,
        })
    }

    async fn data_start(&self) -> Result<usize, SheetError> {
        let mut cached = self.data_start.lock().await;
        if let Some(start) = *cached {
            return Ok(start);
        }
        let detected = self.detect_data_start().await?;
        *cached = detected;
        Ok(detected.unwrap_or(FIRST_DATA_ROW))
    }

    async fn scan_keys(&self) -> Result<HashSet<String>, SheetError> {
        let mut keys = HashSet::new();
        let mut row = self.data_start().await?;
        loop {
            let batch = self.backend.read_rows(row, DEFAULT_PAGE_SIZE).await?;
            let fetched = batch.len();
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|r| r.into_iter().next())
                    .map(|key| key.trim().to_string())
                    .filter(|key| !key.is_empty()),
            );
            if fetched < DEFAULT_PAGE_SIZE {
                return Ok(keys);
            }
            row += fetched;
        }
    }

    async fn verify_row(&self, row_number: usize, source_url: &str) -> Result<bool, StorageError> {
        let rows = self
            .backend
            .read_rows(row_number, 1)
            .await
            .map_err(|err| read_error(&err))?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .is_some_and(|key| key.trim() == source_url))
    }
}

#[async_trait]
impl PostStorage for SheetsSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Sheets
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let schema_err = |err: SheetError| StorageError::SchemaInit {
            sink: SinkKind::Sheets.as_str(),
            detail: err.to_string(),
        };

        let start = match self.detect_data_start().await.map_err(schema_err)? {
            Some(1) => {
                warn!("sheet has no header row; reading posts from row 1");
                1
            }
            Some(start) => start,
            None => {
                let header = SHEET_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>();
                self.backend.write_header(&header).await.map_err(schema_err)?;
                debug!("wrote sheet header");
                FIRST_DATA_ROW
            }
        };
        *self.data_start.lock().await = Some(start);

        let mut index = self.index.lock().await;
        if index.built {
            return Ok(());
        }
        match self.scan_keys().await {
            Ok(keys) => {
                debug!(rows = keys.len(), "built sheet source_url index");
                index.seen.extend(keys);
                index.built = true;
            }
            Err(err) => {
                warn!(error = %err, "could not build sheet index; appends will not dedupe against existing rows");
            }
        }
        Ok(())
    }

    async fn append(&self, post: &Post) -> Result<AppendOutcome, StorageError> {
        let source_url = post.source_url();
        let mut index = self.index.lock().await;
        if index.seen.contains(source_url) {
            return Ok(AppendOutcome::AlreadyPresent);
        }

        // A previous attempt may have landed without being confirmed.
        if let Some(landed) = index.in_doubt.get(source_url).copied() {
            let mut present = match landed {
                Some(row_number) => self.verify_row(row_number, source_url).await?,
                None => false,
            };
            if !present {
                let keys = self.scan_keys().await.map_err(|err| read_error(&err))?;
                present = keys.contains(source_url);
                index.seen.extend(keys);
            }
            index.in_doubt.remove(source_url);
            if present {
                debug!(source_url, "earlier append had landed");
                index.seen.insert(source_url.to_string());
                return Ok(AppendOutcome::Inserted);
            }
        }

        // Recorded before the call so a timeout that drops this future still
        // leaves the key in doubt.
        index.in_doubt.insert(source_url.to_string(), None);
        let row_number = self
            .backend
            .append_row(post_to_row(post))
            .await
            .map_err(|err| StorageError::Write {
                sink: SinkKind::Sheets.as_str(),
                retryable: err.disposition() == RetryDisposition::Retryable,
                detail: err.to_string(),
            })?;
        index.in_doubt.insert(source_url.to_string(), Some(row_number));

        if !self.verify_row(row_number, source_url).await? {
            index.in_doubt.insert(source_url.to_string(), None);
            return Err(StorageError::Verification {
                sink: SinkKind::Sheets.as_str(),
                source_url: source_url.to_string(),
            });
        }
        index.in_doubt.remove(source_url);
        index.seen.insert(source_url.to_string());
        Ok(AppendOutcome::Inserted)
    }

    async fn exists(&self, source_url: &str) -> Result<bool, StorageError> {
        let index = self.index.lock().await;
        if index.seen.contains(source_url) {
            return Ok(true);
        }
        if index.built {
            return Ok(false);
        }
        drop(index);
        let keys = self.scan_keys().await.map_err(|err| read_error(&err))?;
        Ok(keys.contains(source_url))
    }

    async fn list_page(&self, offset: usize, limit: usize) -> Result<PostPage, StorageError> {
        let limit = limit.max(1);
        let start = self.data_start().await.map_err(|err| read_error(&err))?;
        let rows = self
            .backend
            .read_rows(start + offset, limit)
            .await
            .map_err(|err| read_error(&err))?;
        let fetched = rows.len();
        let read_at = Utc::now();
        let posts = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| match post_from_row(row, read_at) {
                Ok(post) => Some(post),
                Err(reason) => {
                    if !is_blank_row(row) {
                        warn!(row = start + offset + i, %reason, "skipping unreadable sheet row");
                    }
                    None
                }
            })
            .collect();
        Ok(PostPage {
            posts,
            next_offset: (fetched == limit).then_some(offset + fetched),
        })
    }
}

fn read_error(err: &SheetError) -> StorageError {
    StorageError::Read {
        sink: SinkKind::Sheets.as_str(),
        detail: err.to_string(),
    }
}

pub fn post_to_row(post: &Post) -> Vec<String> {
    vec![
        post.source_url().to_string(),
        post.caption_text().to_string(),
        post.like_count().to_string(),
        post.comment_count().to_string(),
        post.published_at().to_rfc3339(),
        post.media_type().as_str().to_string(),
        post.captured_at().to_rfc3339(),
    ]
}

/// Parses a stored row. Legacy six-column rows carry no capture time, so
/// `read_at` stands in for it.
pub fn post_from_row(row: &[String], read_at: DateTime<Utc>) -> Result<Post, String> {
    let cell = |i: usize| row.get(i).map(|s| s.trim()).unwrap_or_default();
    if row.len() < 6 {
        return Err(format!("expected at least 6 columns, found {}", row.len()));
    }
    let count = |i: usize| {
        cell(i)
            .replace(',', "")
            .parse::<u64>()
            .map_err(|_| format!("{} is not a count: `{}`", SHEET_COLUMNS[i], cell(i)))
    };
    let like_count = count(2)?;
    let comment_count = count(3)?;
    let published_at =
        parse_timestamp(cell(4)).ok_or_else(|| format!("bad published_at `{}`", cell(4)))?;
    let media_type =
        MediaType::from_label(cell(5)).ok_or_else(|| format!("bad media_type `{}`", cell(5)))?;
    let captured_at = match cell(6) {
        "" => read_at,
        text => parse_timestamp(text).ok_or_else(|| format!("bad captured_at `{text}`"))?,
    };
    Post::new(
        cell(0),
        row.get(1).map(String::as_str).unwrap_or_default(),
        like_count,
        comment_count,
        published_at,
        media_type,
        captured_at,
    )
    .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::post;
    use crate::{list_all, PostCursor};

    fn sink_over(sheet: &Arc<InMemorySheet>) -> SheetsSink {
        SheetsSink::new(sheet.clone() as Arc<dyn SheetBackend>)
    }

    #[tokio::test]
    async fn ensure_schema_writes_header_once() {
        let sheet = Arc::new(InMemorySheet::new());
        let sink = sink_over(&sheet);
        sink.ensure_schema().await.unwrap();
        sink.ensure_schema().await.unwrap();
        let rows = sheet.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "source_url");
        assert_eq!(rows[0].len(), SHEET_COLUMNS.len());
        assert!(sink.index_built().await);
    }

    #[tokio::test]
    async fn repeated_appends_leave_one_row() {
        let sheet = Arc::new(InMemorySheet::new());
        let sink = sink_over(&sheet);
        sink.ensure_schema().await.unwrap();

        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::AlreadyPresent);
        assert_eq!(sink.append(&post("u1", 5)).await.unwrap(), AppendOutcome::AlreadyPresent);

        let data_rows = sheet.rows().await.into_iter().skip(1).collect::<Vec<_>>();
        assert_eq!(data_rows.len(), 1);
        assert_eq!(data_rows[0][0], "u1");
    }

    #[tokio::test]
    async fn index_from_existing_rows_survives_restart() {
        let sheet = Arc::new(InMemorySheet::new());
        {
            let sink = sink_over(&sheet);
            sink.ensure_schema().await.unwrap();
            sink.append(&post("u1", 1)).await.unwrap();
        }

        let sink = sink_over(&sheet);
        sink.ensure_schema().await.unwrap();
        assert!(sink.exists("u1").await.unwrap());
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::AlreadyPresent);
        assert_eq!(sheet.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn lists_rows_including_legacy_layout() {
        let header = SHEET_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        let legacy = vec![
            "https://www.instagram.com/p/old/".to_string(),
            "from before".to_string(),
            "12".to_string(),
            "4".to_string(),
            "2024-05-01T08:00:00".to_string(),
            "GraphVideo".to_string(),
        ];
        let broken = vec!["u-broken".to_string(), "x".to_string()];
        let sheet = Arc::new(InMemorySheet::with_rows(vec![
            header,
            legacy,
            broken,
            post_to_row(&post("u2", 7)),
        ]));
        let sink = sink_over(&sheet);

        let mut cursor = list_all(&sink);
        let mut posts = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            posts.extend(page);
        }
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].media_type(), MediaType::Video);
        assert_eq!(posts[0].like_count(), 12);
        assert_eq!(posts[1], post("u2", 7));
    }

    #[tokio::test]
    async fn small_pages_cover_every_row() {
        let sheet = Arc::new(InMemorySheet::new());
        let sink = sink_over(&sheet);
        sink.ensure_schema().await.unwrap();
        for i in 0..5 {
            sink.append(&post(&format!("u{i}"), i)).await.unwrap();
        }
        let mut cursor = PostCursor::new(&sink, 2);
        let mut count = 0;
        while let Some(page) = cursor.next_page().await.unwrap() {
            count += page.len();
        }
        assert_eq!(count, 5);
    }

    struct LossyReadBack {
        inner: InMemorySheet,
        fail_next_read: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SheetBackend for LossyReadBack {
        async fn read_rows(&self, first_row: usize, limit: usize) -> Result<Vec<Vec<String>>, SheetError> {
            if self.fail_next_read.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(SheetError::Status {
                    status: 503,
                    body: "backend unavailable".into(),
                });
            }
            self.inner.read_rows(first_row, limit).await
        }

        async fn write_header(&self, header: &[String]) -> Result<(), SheetError> {
            self.inner.write_header(header).await
        }

        async fn append_row(&self, row: Vec<String>) -> Result<usize, SheetError> {
            let n = self.inner.append_row(row).await?;
            self.fail_next_read.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(n)
        }
    }

    #[tokio::test]
    async fn failed_read_back_is_reverified_not_reappended() {
        let backend = Arc::new(LossyReadBack {
            inner: InMemorySheet::new(),
            fail_next_read: Default::default(),
        });
        let sink = SheetsSink::new(backend.clone() as Arc<dyn SheetBackend>);
        sink.ensure_schema().await.unwrap();

        let err = sink.append(&post("u1", 1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::AlreadyPresent);
        assert_eq!(backend.inner.rows().await.len(), 2);
    }

    /// Stores the next append, then reports it as failed.
    struct LostAck {
        inner: InMemorySheet,
        drop_next_ack: std::sync::atomic::AtomicBool,
        store_on_failure: bool,
    }

    #[async_trait]
    impl SheetBackend for LostAck {
        async fn read_rows(&self, first_row: usize, limit: usize) -> Result<Vec<Vec<String>>, SheetError> {
            self.inner.read_rows(first_row, limit).await
        }

        async fn write_header(&self, header: &[String]) -> Result<(), SheetError> {
            self.inner.write_header(header).await
        }

        async fn append_row(&self, row: Vec<String>) -> Result<usize, SheetError> {
            if self.drop_next_ack.swap(false, std::sync::atomic::Ordering::SeqCst) {
                if self.store_on_failure {
                    self.inner.append_row(row).await?;
                }
                return Err(SheetError::Status {
                    status: 503,
                    body: "backend unavailable".into(),
                });
            }
            self.inner.append_row(row).await
        }
    }

    fn lost_ack(store_on_failure: bool) -> Arc<LostAck> {
        Arc::new(LostAck {
            inner: InMemorySheet::new(),
            drop_next_ack: std::sync::atomic::AtomicBool::new(true),
            store_on_failure,
        })
    }

    #[tokio::test]
    async fn append_that_landed_before_an_error_is_not_repeated() {
        let backend = lost_ack(true);
        let sink = SheetsSink::new(backend.clone() as Arc<dyn SheetBackend>);
        sink.ensure_schema().await.unwrap();

        let err = sink.append(&post("u1", 1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::AlreadyPresent);

        let keys = backend.inner.rows().await.into_iter().skip(1).map(|r| r[0].clone()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn append_that_never_landed_is_written_on_retry() {
        let backend = lost_ack(false);
        let sink = SheetsSink::new(backend.clone() as Arc<dyn SheetBackend>);
        sink.ensure_schema().await.unwrap();

        assert!(sink.append(&post("u1", 1)).await.is_err());
        assert_eq!(sink.append(&post("u1", 1)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(backend.inner.rows().await.len(), 2);
    }

    fn legacy_row(key: &str, likes: u64) -> Vec<String> {
        vec![
            key.to_string(),
            format!("legacy {key}"),
            likes.to_string(),
            "1".to_string(),
            "2024-05-01T08:00:00".to_string(),
            "GraphImage".to_string(),
        ]
    }

    #[tokio::test]
    async fn headerless_sheet_keeps_its_first_row() {
        let rows = (0..5).map(|i| legacy_row(&format!("L{i}"), i)).collect::<Vec<_>>();
        let sheet = Arc::new(InMemorySheet::with_rows(rows.clone()));
        let sink = sink_over(&sheet);
        sink.ensure_schema().await.unwrap();
        assert_eq!(sheet.rows().await, rows);

        let mut cursor = PostCursor::new(&sink, 2);
        let mut keys = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            keys.extend(page.iter().map(|p| p.source_url().to_string()));
        }
        assert_eq!(keys, vec!["L0", "L1", "L2", "L3", "L4"]);

        assert!(sink.exists("L0").await.unwrap());
        let first = post_from_row(&rows[0], Utc::now()).unwrap();
        assert_eq!(sink.append(&first).await.unwrap(), AppendOutcome::AlreadyPresent);
        assert_eq!(sink.append(&post("n1", 1)).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(sheet.rows().await.len(), 6);
    }

    #[tokio::test]
    async fn headerless_sheet_is_listed_without_ensure_schema() {
        let sheet = Arc::new(InMemorySheet::with_rows(vec![legacy_row("L0", 1), legacy_row("L1", 2)]));
        let sink = sink_over(&sheet);
        assert!(sink.exists("L0").await.unwrap());
        let page = sink.list_page(0, 10).await.unwrap();
        assert_eq!(page.posts.len(), 2);
    }

    #[test]
    fn worksheet_names_are_quoted_in_ranges() {
        assert_eq!(a1_range("Posts", "A1:G1"), "'Posts'!A1:G1");
        assert_eq!(a1_range("Bob's Posts", "A2:G9"), "'Bob''s Posts'!A2:G9");
        assert_eq!(parse_row_number(&a1_range("My Sheet", "A7:G7")), Some(7));
    }

    #[tokio::test]
    async fn static_token_is_used_as_is_and_missing_key_file_is_rejected() {
        let auth = SheetsAuth::Static("tok".into());
        assert_eq!(auth.bearer_token().await.unwrap(), "tok");
        assert!(SheetsAuth::service_account(Path::new("/nonexistent/ieh-key.json")).is_err());
    }

    #[test]
    fn row_numbers_come_from_updated_range() {
        assert_eq!(parse_row_number("Posts!A5:G5"), Some(5));
        assert_eq!(parse_row_number("'My Sheet'!A120:G120"), Some(120));
        assert_eq!(parse_row_number("garbage"), None);
    }
}
