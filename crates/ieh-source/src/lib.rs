//! Source contract for raw posts plus the fixture-backed implementation.
//!
//! The live platform client is an external collaborator; anything that can
//! answer `fetch_next` for a target and position plugs in here.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ieh_core::{ErrorKind, RawPost};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "ieh-source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Profile,
    Hashtag,
}

/// A profile handle or a `#hashtag` configured for harvesting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    name: String,
    kind: TargetKind,
}

impl Target {
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let (kind, name) = match trimmed.strip_prefix('#') {
            Some(tag) => (TargetKind::Hashtag, tag.trim()),
            None => (TargetKind::Profile, trimmed.trim_start_matches('@')),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Filesystem-safe identifier; hashtags are prefixed so they never collide with profiles.
    pub fn slug(&self) -> String {
        let base = self
            .name
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        match self.kind {
            TargetKind::Profile => base,
            TargetKind::Hashtag => format!("tag-{base}"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Profile => f.write_str(&self.name),
            TargetKind::Hashtag => write!(f, "#{}", self.name),
        }
    }
}

/// Network identity a request leaves through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressIdentity {
    Direct,
    Proxy(String),
}

impl EgressIdentity {
    pub fn proxy_url(&self) -> Option<&str> {
        match self {
            EgressIdentity::Direct => None,
            EgressIdentity::Proxy(url) => Some(url),
        }
    }
}

impl fmt::Display for EgressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressIdentity::Direct => f.write_str("direct"),
            EgressIdentity::Proxy(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub target: &'a Target,
    /// Zero-based index of the item within the target's feed.
    pub position: usize,
    pub identity: &'a EgressIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Post(RawPost),
    EndOfTarget,
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("throttled by the platform")]
    Throttled { retry_after: Option<Duration> },
    #[error("{target} is private or unavailable: {reason}")]
    PrivateOrUnavailable { target: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Throttled { .. } => ErrorKind::Throttled,
            SourceError::PrivateOrUnavailable { .. } => ErrorKind::PrivateOrUnavailable,
            SourceError::Transport(_) => ErrorKind::Transport,
        }
    }
}

#[async_trait]
pub trait PostSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Returns the item at `request.position`. Repeating a request for the same
    /// position yields the same item, which is what makes retries safe.
    async fn fetch_next(&self, request: FetchRequest<'_>) -> Result<Fetched, SourceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Captured feed for one target, stored as `<fixtures_dir>/<slug>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub target: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    /// Positions that answer with a throttle the first time they are requested.
    #[serde(default)]
    pub throttle_once_at: Vec<usize>,
    pub posts: Vec<RawPost>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
struct FixtureState {
    bundles: HashMap<String, Arc<FixtureBundle>>,
    throttled: HashSet<(String, usize)>,
}

/// Serves captured feeds from disk; no network access.
#[derive(Debug)]
pub struct FixtureSource {
    root: PathBuf,
    state: Mutex<FixtureState>,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(FixtureState::default()),
        }
    }

    pub fn bundle_path_for(&self, target: &Target) -> PathBuf {
        self.root.join(format!("{}.json", target.slug()))
    }
}

#[async_trait]
impl PostSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_next(&self, request: FetchRequest<'_>) -> Result<Fetched, SourceError> {
        let slug = request.target.slug();
        let mut state = self.state.lock().await;

        let cached = state.bundles.get(&slug).cloned();
        let bundle = match cached {
            Some(bundle) => bundle,
            None => {
                let path = self.bundle_path_for(request.target);
                let bundle = load_fixture_bundle(&path).map_err(|err| SourceError::PrivateOrUnavailable {
                    target: request.target.to_string(),
                    reason: format!("{err:#}"),
                })?;
                debug!(target = %request.target, path = %path.display(), posts = bundle.posts.len(), "loaded fixture bundle");
                let bundle = Arc::new(bundle);
                state.bundles.insert(slug.clone(), bundle.clone());
                bundle
            }
        };

        if bundle.visibility == Visibility::Private {
            return Err(SourceError::PrivateOrUnavailable {
                target: request.target.to_string(),
                reason: "account is private".into(),
            });
        }

        if bundle.throttle_once_at.contains(&request.position)
            && state.throttled.insert((slug, request.position))
        {
            return Err(SourceError::Throttled { retry_after: None });
        }

        Ok(match bundle.posts.get(request.position) {
            Some(raw) => Fetched::Post(raw.clone()),
            None => Fetched::EndOfTarget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_bundle(dir: &Path, slug: &str, body: &str) {
        fs::write(dir.join(format!("{slug}.json")), body).expect("write fixture");
    }

    #[test]
    fn targets_parse_profiles_and_hashtags() {
        let tag = Target::parse(" #Sunset Pics ").unwrap();
        assert_eq!(tag.kind(), TargetKind::Hashtag);
        assert_eq!(tag.to_string(), "#Sunset Pics");
        assert_eq!(tag.slug(), "tag-sunset-pics");

        let profile = Target::parse("@nat_geo").unwrap();
        assert_eq!(profile.kind(), TargetKind::Profile);
        assert_eq!(profile.slug(), "nat_geo");

        assert!(Target::parse("#").is_none());
        assert!(Target::parse("   ").is_none());
    }

    #[tokio::test]
    async fn serves_positions_then_end_of_target() {
        let dir = tempdir().expect("tempdir");
        write_bundle(
            dir.path(),
            "natgeo",
            r#"{"target":"natgeo","throttle_once_at":[1],"posts":[{"shortcode":"a"},{"shortcode":"b"}]}"#,
        );
        let source = FixtureSource::new(dir.path());
        let target = Target::parse("natgeo").unwrap();
        let identity = EgressIdentity::Direct;
        let req = |position| FetchRequest {
            target: &target,
            position,
            identity: &identity,
        };

        assert!(matches!(source.fetch_next(req(0)).await, Ok(Fetched::Post(p)) if p.shortcode.as_deref() == Some("a")));
        assert!(matches!(source.fetch_next(req(1)).await, Err(SourceError::Throttled { .. })));
        assert!(matches!(source.fetch_next(req(1)).await, Ok(Fetched::Post(p)) if p.shortcode.as_deref() == Some("b")));
        assert_eq!(source.fetch_next(req(2)).await.unwrap(), Fetched::EndOfTarget);
    }

    #[tokio::test]
    async fn private_and_missing_targets_are_unavailable() {
        let dir = tempdir().expect("tempdir");
        write_bundle(dir.path(), "locked", r#"{"target":"locked","visibility":"private","posts":[]}"#);
        let source = FixtureSource::new(dir.path());
        let identity = EgressIdentity::Direct;

        for name in ["locked", "ghost"] {
            let target = Target::parse(name).unwrap();
            let err = source
                .fetch_next(FetchRequest {
                    target: &target,
                    position: 0,
                    identity: &identity,
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PrivateOrUnavailable);
        }
    }
}
