//! Core domain model for IEH: the canonical post record, raw source records and
//! the normalization between them.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ieh-core";

/// Base used to derive a post URL when a source only reports a shortcode.
pub const POST_URL_BASE: &str = "https://www.instagram.com/p/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Carousel,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Carousel => "carousel",
        }
    }

    /// Maps the labels platforms and scraping clients report onto the canonical set.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" | "graphimage" => Some(MediaType::Image),
            "video" | "reel" | "clips" | "graphvideo" => Some(MediaType::Video),
            "carousel" | "sidecar" | "album" | "graphsidecar" => Some(MediaType::Carousel),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical post record. Immutable once built; a correction is a new write.
/// Deserialization goes through [`Post::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PostFields")]
pub struct Post {
    source_url: String,
    caption_text: String,
    like_count: u64,
    comment_count: u64,
    published_at: DateTime<Utc>,
    media_type: MediaType,
    captured_at: DateTime<Utc>,
}

impl Post {
    pub fn new(
        source_url: &str,
        caption_text: &str,
        like_count: u64,
        comment_count: u64,
        published_at: DateTime<Utc>,
        media_type: MediaType,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, NormalizeError> {
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(NormalizeError::MissingField("source_url"));
        }
        Ok(Self {
            source_url: source_url.to_string(),
            caption_text: strip_control_chars(caption_text),
            like_count,
            comment_count,
            published_at,
            media_type,
            captured_at,
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn caption_text(&self) -> &str {
        &self.caption_text
    }

    pub fn like_count(&self) -> u64 {
        self.like_count
    }

    pub fn comment_count(&self) -> u64 {
        self.comment_count
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

#[derive(Deserialize)]
struct PostFields {
    source_url: String,
    #[serde(default)]
    caption_text: String,
    like_count: u64,
    comment_count: u64,
    published_at: DateTime<Utc>,
    media_type: MediaType,
    captured_at: DateTime<Utc>,
}

impl TryFrom<PostFields> for Post {
    type Error = NormalizeError;

    fn try_from(fields: PostFields) -> Result<Self, Self::Error> {
        Post::new(
            &fields.source_url,
            &fields.caption_text,
            fields.like_count,
            fields.comment_count,
            fields.published_at,
            fields.media_type,
            fields.captured_at,
        )
    }
}

/// Timestamp as a scraping client may report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    UnixSeconds(i64),
    Text(String),
}

impl RawTimestamp {
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::UnixSeconds(secs) => DateTime::from_timestamp(*secs, 0),
            RawTimestamp::Text(text) => parse_timestamp(text),
        }
    }
}

/// Record handed over by a `PostSource` before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPost {
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub shortcode: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    #[serde(default)]
    pub published_at: Option<RawTimestamp>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl RawPost {
    /// Best-effort key for logging, even when the record is malformed.
    pub fn display_key(&self) -> String {
        resolve_source_url(self).unwrap_or_else(|| "<unknown>".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("unrecognized media type `{0}`")]
    UnknownMediaType(String),
    #[error("`{field}` reported a negative count ({value})")]
    NegativeCount { field: &'static str, value: i64 },
    #[error("unparseable timestamp `{0}`")]
    InvalidTimestamp(String),
}

impl NormalizeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedPost
    }
}

/// Validate and convert a raw record into the canonical form.
pub fn normalize(raw: &RawPost, captured_at: DateTime<Utc>) -> Result<Post, NormalizeError> {
    let source_url = resolve_source_url(raw).ok_or(NormalizeError::MissingField("source_url"))?;

    let published_at = match &raw.published_at {
        None => return Err(NormalizeError::MissingField("published_at")),
        Some(ts) => ts.to_utc().ok_or_else(|| {
            NormalizeError::InvalidTimestamp(match ts {
                RawTimestamp::UnixSeconds(secs) => secs.to_string(),
                RawTimestamp::Text(text) => text.clone(),
            })
        })?,
    };

    let label = raw
        .media_type
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(NormalizeError::MissingField("media_type"))?;
    let media_type =
        MediaType::from_label(label).ok_or_else(|| NormalizeError::UnknownMediaType(label.to_string()))?;

    let like_count = non_negative("like_count", raw.like_count)?;
    let comment_count = non_negative("comment_count", raw.comment_count)?;

    Post::new(
        &source_url,
        raw.caption.as_deref().unwrap_or_default(),
        like_count,
        comment_count,
        published_at,
        media_type,
        captured_at,
    )
}

fn resolve_source_url(raw: &RawPost) -> Option<String> {
    if let Some(url) = raw.source_url.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(url.to_string());
    }
    raw.shortcode
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|code| format!("{POST_URL_BASE}{code}/"))
}

fn non_negative(field: &'static str, value: Option<i64>) -> Result<u64, NormalizeError> {
    let value = value.ok_or(NormalizeError::MissingField(field))?;
    u64::try_from(value).map_err(|_| NormalizeError::NegativeCount { field, value })
}

/// Parses RFC 3339, or a naive ISO timestamp which is taken to be UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Drops control characters, keeping line breaks, and trims the result.
pub fn strip_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Error taxonomy shared by every crate; run summaries aggregate counts per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Throttled,
    Transport,
    NoHealthyIdentity,
    PrivateOrUnavailable,
    MalformedPost,
    SinkWriteError,
    SchemaInitError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transport => "transport",
            ErrorKind::NoHealthyIdentity => "no_healthy_identity",
            ErrorKind::PrivateOrUnavailable => "private_or_unavailable",
            ErrorKind::MalformedPost => "malformed_post",
            ErrorKind::SinkWriteError => "sink_write_error",
            ErrorKind::SchemaInitError => "schema_init_error",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::Transport | ErrorKind::SinkWriteError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn raw() -> RawPost {
        RawPost {
            source_url: Some("https://www.instagram.com/p/abc/".into()),
            shortcode: None,
            caption: Some("hello\u{0007} world\n".into()),
            like_count: Some(42),
            comment_count: Some(3),
            published_at: Some(RawTimestamp::Text("2026-02-28T09:30:00+02:00".into())),
            media_type: Some("GraphSidecar".into()),
        }
    }

    #[test]
    fn normalizes_a_complete_record() {
        let post = normalize(&raw(), captured()).expect("post");
        assert_eq!(post.source_url(), "https://www.instagram.com/p/abc/");
        assert_eq!(post.caption_text(), "hello world");
        assert_eq!(post.like_count(), 42);
        assert_eq!(post.media_type(), MediaType::Carousel);
        assert_eq!(
            post.published_at(),
            Utc.with_ymd_and_hms(2026, 2, 28, 7, 30, 0).single().unwrap()
        );
        assert_eq!(post.captured_at(), captured());
    }

    #[test]
    fn derives_url_from_shortcode() {
        let mut r = raw();
        r.source_url = None;
        r.shortcode = Some("XyZ".into());
        let post = normalize(&r, captured()).expect("post");
        assert_eq!(post.source_url(), "https://www.instagram.com/p/XyZ/");
    }

    #[test]
    fn missing_published_at_is_malformed() {
        let mut r = raw();
        r.published_at = None;
        let err = normalize(&r, captured()).unwrap_err();
        assert_eq!(err, NormalizeError::MissingField("published_at"));
        assert_eq!(err.kind(), ErrorKind::MalformedPost);
    }

    #[test]
    fn rejects_unknown_media_and_negative_counts() {
        let mut r = raw();
        r.media_type = Some("story".into());
        assert!(matches!(
            normalize(&r, captured()),
            Err(NormalizeError::UnknownMediaType(_))
        ));

        let mut r = raw();
        r.comment_count = Some(-1);
        assert_eq!(
            normalize(&r, captured()).unwrap_err(),
            NormalizeError::NegativeCount { field: "comment_count", value: -1 }
        );
    }

    #[test]
    fn timestamps_accept_unix_and_naive_forms() {
        let unix = RawTimestamp::UnixSeconds(1_772_000_000).to_utc().unwrap();
        assert_eq!(unix.timestamp(), 1_772_000_000);
        let naive = parse_timestamp("2026-01-02 03:04:05").unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().unwrap());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn deserialized_posts_are_validated() {
        let post: Post = serde_json::from_str(
            r#"{"source_url":"  u1 ","caption_text":"a\u0007b","like_count":1,"comment_count":0,
                "published_at":"2026-01-01T00:00:00Z","media_type":"video","captured_at":"2026-01-02T00:00:00Z"}"#,
        )
        .expect("post");
        assert_eq!(post.source_url(), "u1");
        assert_eq!(post.caption_text(), "ab");

        let blank = serde_json::from_str::<Post>(
            r#"{"source_url":" ","like_count":1,"comment_count":0,
                "published_at":"2026-01-01T00:00:00Z","media_type":"video","captured_at":"2026-01-02T00:00:00Z"}"#,
        );
        assert!(blank.is_err());
    }

    #[test]
    fn raw_post_deserializes_mixed_timestamp_shapes() {
        let parsed: Vec<RawPost> = serde_json::from_str(
            r#"[{"shortcode":"a","published_at":1700000000,"media_type":"reel","like_count":1,"comment_count":0},
                {"source_url":"u","published_at":"2026-01-01T00:00:00Z"}]"#,
        )
        .expect("json");
        assert_eq!(parsed[0].published_at, Some(RawTimestamp::UnixSeconds(1_700_000_000)));
        assert!(matches!(parsed[1].published_at, Some(RawTimestamp::Text(_))));
        assert_eq!(parsed[1].caption, None);
    }
}
