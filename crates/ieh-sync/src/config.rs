//! Run configuration: YAML file, then environment overrides, then validation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ieh_source::Target;
use ieh_storage::{BackoffPolicy, GoogleSheetsConfig, SheetsAuth, SinkKind};
use serde::Deserialize;
use thiserror::Error;

use crate::ingest::IngestPolicy;
use crate::pacing::RateLimiterConfig;

pub const DEFAULT_CONFIG_PATH: &str = "ieh.yaml";
pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

/// Upper bound on the base spacing between requests.
pub const MAX_REQUEST_INTERVAL_SECS: f64 = 3_600.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("loading service account key {path}: {detail}")]
    Credentials { path: PathBuf, detail: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SheetsSettings {
    pub spreadsheet_id: String,
    pub worksheet_name: String,
    /// Service-account JSON key; preferred over `access_token` when both are set.
    #[serde(default)]
    pub service_account_json_path: Option<PathBuf>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    DEFAULT_SHEETS_API_BASE.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub targets: Vec<String>,
    pub min_request_interval_secs: f64,
    pub max_backoff_multiplier: u32,
    pub jitter_ratio: f64,
    pub proxy_list: Vec<String>,
    pub proxy_list_file: Option<PathBuf>,
    pub proxy_cooldown_secs: u64,
    pub direct_fallback: bool,
    pub sinks: BTreeSet<SinkKind>,
    pub relational_connection_string: Option<String>,
    pub sheets: Option<SheetsSettings>,
    pub max_fetch_attempts: usize,
    pub sink_write_attempts: usize,
    pub fetch_timeout_secs: u64,
    pub sink_timeout_secs: u64,
    pub max_posts_per_target: usize,
    pub workers: usize,
    pub fixtures_dir: PathBuf,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            min_request_interval_secs: 2.0,
            max_backoff_multiplier: 16,
            jitter_ratio: 0.2,
            proxy_list: Vec::new(),
            proxy_list_file: None,
            proxy_cooldown_secs: 60,
            direct_fallback: false,
            sinks: BTreeSet::from([SinkKind::Sheets]),
            relational_connection_string: None,
            sheets: None,
            max_fetch_attempts: 4,
            sink_write_attempts: 3,
            fetch_timeout_secs: 30,
            sink_timeout_secs: 20,
            max_posts_per_target: 20,
            workers: 1,
            fixtures_dir: PathBuf::from("./fixtures"),
        }
    }
}

impl HarvestConfig {
    /// Loads `path` (or the default file when present) and applies process
    /// environment overrides. Callers validate once they know which sinks they need.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides from `IEH_*` variables and `DATABASE_URL`; `lookup` abstracts the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(targets) = lookup("IEH_TARGETS") {
            self.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("IEH_MIN_REQUEST_INTERVAL_SECS") {
            self.min_request_interval_secs = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "IEH_MIN_REQUEST_INTERVAL_SECS",
                value: value.clone(),
            })?;
        }
        if let Some(path) = lookup("IEH_PROXY_LIST_FILE") {
            self.proxy_list_file = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.relational_connection_string = Some(url);
        }
        if let Some(sheets) = self.sheets.as_mut() {
            if let Some(path) = lookup("GOOGLE_SERVICE_ACCOUNT_JSON_PATH") {
                sheets.service_account_json_path = Some(PathBuf::from(path));
            }
            if let Some(token) = lookup("IEH_SHEETS_ACCESS_TOKEN") {
                sheets.access_token = Some(token);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.sinks.is_empty() {
            return invalid("at least one sink must be enabled");
        }
        if self.sinks.contains(&SinkKind::Relational)
            && self
                .relational_connection_string
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return invalid("relational sink requires relational_connection_string (or DATABASE_URL)");
        }
        if self.sinks.contains(&SinkKind::Sheets) {
            match &self.sheets {
                None => return invalid("sheets sink requires a `sheets` section"),
                Some(s) if s.spreadsheet_id.trim().is_empty() || s.worksheet_name.trim().is_empty() => {
                    return invalid("sheets sink requires spreadsheet_id and worksheet_name")
                }
                Some(s)
                    if s.service_account_json_path.is_none()
                        && s.access_token.as_deref().map_or(true, |t| t.trim().is_empty()) =>
                {
                    return invalid(
                        "sheets sink requires service_account_json_path (GOOGLE_SERVICE_ACCOUNT_JSON_PATH) or an access token",
                    )
                }
                Some(_) => {}
            }
        }
        if !(0.0..=MAX_REQUEST_INTERVAL_SECS).contains(&self.min_request_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "min_request_interval_secs must be within [0, {MAX_REQUEST_INTERVAL_SECS}]"
            )));
        }
        if self.max_backoff_multiplier < 1 {
            return invalid("max_backoff_multiplier must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return invalid("jitter_ratio must be within [0, 1]");
        }
        if self.max_fetch_attempts < 1 || self.sink_write_attempts < 1 {
            return invalid("attempt budgets must be at least 1");
        }
        if self.workers < 1 {
            return invalid("workers must be at least 1");
        }
        if self.max_posts_per_target < 1 {
            return invalid("max_posts_per_target must be at least 1");
        }
        if self.fetch_timeout_secs < 1 || self.sink_timeout_secs < 1 {
            return invalid("fetch_timeout_secs and sink_timeout_secs must be at least 1");
        }
        if let Some(bad) = self.targets.iter().find(|t| Target::parse(t).is_none()) {
            return Err(ConfigError::Invalid(format!("target `{bad}` is empty")));
        }
        Ok(())
    }

    pub fn parsed_targets(&self) -> Vec<Target> {
        self.targets.iter().filter_map(|t| Target::parse(t)).collect()
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            min_interval: Duration::from_secs_f64(self.min_request_interval_secs),
            max_multiplier: self.max_backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy {
            fetch_backoff: BackoffPolicy {
                max_attempts: self.max_fetch_attempts,
                ..BackoffPolicy::default()
            },
            sink_backoff: BackoffPolicy {
                max_attempts: self.sink_write_attempts,
                ..BackoffPolicy::default()
            },
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            sink_timeout: Duration::from_secs(self.sink_timeout_secs),
            throttle_cooldown: Duration::from_secs(self.proxy_cooldown_secs),
            max_posts_per_target: self.max_posts_per_target,
            workers: self.workers,
        }
    }

    /// Client settings for the sheets sink. Loads the service-account key when one is configured.
    pub fn google_sheets_config(&self) -> Result<GoogleSheetsConfig, ConfigError> {
        let sheets = self
            .sheets
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("sheets sink requires a `sheets` section".into()))?;
        let auth = match (&sheets.service_account_json_path, &sheets.access_token) {
            (Some(path), _) => SheetsAuth::service_account(path).map_err(|err| ConfigError::Credentials {
                path: path.clone(),
                detail: err.to_string(),
            })?,
            (None, Some(token)) if !token.trim().is_empty() => SheetsAuth::Static(token.trim().to_string()),
            (None, _) => {
                return Err(ConfigError::Invalid(
                    "sheets sink requires service_account_json_path or an access token".into(),
                ))
            }
        };
        Ok(GoogleSheetsConfig {
            api_base: sheets.api_base.clone(),
            spreadsheet_id: sheets.spreadsheet_id.clone(),
            worksheet_name: sheets.worksheet_name.clone(),
            auth,
            timeout: Duration::from_secs(self.sink_timeout_secs),
        })
    }
}
