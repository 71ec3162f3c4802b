//! Postgres sink: table `instagram_posts` keyed by `source_url`, written by upsert.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ieh_core::{MediaType, Post};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::{AppendOutcome, PostPage, PostStorage, SinkKind, StorageError};

pub const TABLE_NAME: &str = "instagram_posts";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS instagram_posts (
    source_url    TEXT PRIMARY KEY,
    caption_text  TEXT NOT NULL DEFAULT '',
    like_count    BIGINT NOT NULL CHECK (like_count >= 0),
    comment_count BIGINT NOT NULL CHECK (comment_count >= 0),
    published_at  TIMESTAMPTZ NOT NULL,
    media_type    TEXT NOT NULL,
    captured_at   TIMESTAMPTZ NOT NULL
)
"#;

/// Owns a connection pool; call `close` when the run ends.
#[derive(Debug, Clone)]
pub struct RelationalSink {
    pool: PgPool,
}

impl RelationalSink {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|err| StorageError::SchemaInit {
                sink: SinkKind::Relational.as_str(),
                detail: format!("connecting: {err}"),
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn write_error(err: sqlx::Error) -> StorageError {
    let retryable = matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Protocol(_)
    );
    StorageError::Write {
        sink: SinkKind::Relational.as_str(),
        detail: err.to_string(),
        retryable,
    }
}

fn read_error(err: sqlx::Error) -> StorageError {
    StorageError::Read {
        sink: SinkKind::Relational.as_str(),
        detail: err.to_string(),
    }
}

fn count_to_sql(field: &str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Write {
        sink: SinkKind::Relational.as_str(),
        detail: format!("{field} {value} exceeds BIGINT"),
        retryable: false,
    })
}

fn post_from_pg_row(row: &PgRow) -> Result<Post, StorageError> {
    let source_url: String = row.try_get("source_url").map_err(read_error)?;
    let caption_text: String = row.try_get("caption_text").map_err(read_error)?;
    let like_count: i64 = row.try_get("like_count").map_err(read_error)?;
    let comment_count: i64 = row.try_get("comment_count").map_err(read_error)?;
    let published_at: DateTime<Utc> = row.try_get("published_at").map_err(read_error)?;
    let media_label: String = row.try_get("media_type").map_err(read_error)?;
    let captured_at: DateTime<Utc> = row.try_get("captured_at").map_err(read_error)?;

    let invalid = |detail: String| StorageError::Read {
        sink: SinkKind::Relational.as_str(),
        detail: format!("row {source_url}: {detail}"),
    };
    let media_type = MediaType::from_label(&media_label)
        .ok_or_else(|| invalid(format!("unknown media_type `{media_label}`")))?;
    Post::new(
        &source_url,
        &caption_text,
        like_count.max(0) as u64,
        comment_count.max(0) as u64,
        published_at,
        media_type,
        captured_at,
    )
    .map_err(|err| invalid(err.to_string()))
}

#[async_trait]
impl PostStorage for RelationalSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Relational
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|err| StorageError::SchemaInit {
                sink: SinkKind::Relational.as_str(),
                detail: err.to_string(),
            })?;
        debug!(table = TABLE_NAME, "relational schema ready");
        Ok(())
    }

    async fn append(&self, post: &Post) -> Result<AppendOutcome, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO instagram_posts (
                source_url, caption_text, like_count, comment_count,
                published_at, media_type, captured_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_url)
            DO UPDATE SET
                caption_text = EXCLUDED.caption_text,
                like_count = EXCLUDED.like_count,
                comment_count = EXCLUDED.comment_count,
                published_at = EXCLUDED.published_at,
                media_type = EXCLUDED.media_type,
                captured_at = EXCLUDED.captured_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(post.source_url())
        .bind(post.caption_text())
        .bind(count_to_sql("like_count", post.like_count())?)
        .bind(count_to_sql("comment_count", post.comment_count())?)
        .bind(post.published_at())
        .bind(post.media_type().as_str())
        .bind(post.captured_at())
        .fetch_one(&self.pool)
        .await
        .map_err(write_error)?;

        let inserted: bool = row.try_get("inserted").map_err(write_error)?;
        Ok(if inserted {
            AppendOutcome::Inserted
        } else {
            AppendOutcome::Updated
        })
    }

    async fn exists(&self, source_url: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM instagram_posts WHERE source_url = $1) AS present")
            .bind(source_url)
            .fetch_one(&self.pool)
            .await
            .map_err(read_error)?;
        row.try_get("present").map_err(read_error)
    }

    async fn list_page(&self, offset: usize, limit: usize) -> Result<PostPage, StorageError> {
        let limit = limit.max(1);
        let rows = sqlx::query(
            r#"
            SELECT source_url, caption_text, like_count, comment_count,
                   published_at, media_type, captured_at
              FROM instagram_posts
             ORDER BY source_url
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error)?;

        let fetched = rows.len();
        let posts = rows.iter().map(post_from_pg_row).collect::<Result<Vec<_>, _>>()?;
        Ok(PostPage {
            posts,
            next_offset: (fetched == limit).then_some(offset + fetched),
        })
    }
}
