use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use ieh_core::ErrorKind;
use ieh_source::EgressIdentity;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("no healthy egress identity ({cooling} cooling down)")]
    NoHealthyIdentity { cooling: usize },
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NoHealthyIdentity
    }
}

/// Health figures for one identity as exposed by the diagnostic API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyDiagnostic {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub healthy: bool,
    pub cooling_down_secs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct IdentityStats {
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    total_latency: Duration,
    latency_samples: u32,
}

impl IdentityStats {
    fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_failures = 0;
    }

    fn diagnostic(&self, cooling_until: Option<Instant>, now: Instant) -> ProxyDiagnostic {
        let attempts = self.successes + self.failures;
        let remaining = cooling_until
            .filter(|until| *until > now)
            .map(|until| until - now);
        ProxyDiagnostic {
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            error_rate: if attempts == 0 {
                0.0
            } else {
                self.failures as f64 / attempts as f64
            },
            avg_latency_ms: if self.latency_samples == 0 {
                0.0
            } else {
                self.total_latency.as_secs_f64() * 1_000.0 / f64::from(self.latency_samples)
            },
            healthy: remaining.is_none(),
            cooling_down_secs: remaining.map_or(0, |d| d.as_secs_f64().ceil() as u64),
        }
    }
}

#[derive(Debug)]
struct ProxyEntry {
    url: String,
    cooling_until: Option<Instant>,
    stats: IdentityStats,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    cursor: usize,
    direct: IdentityStats,
}

fn find_entry<'a>(entries: &'a mut [ProxyEntry], identity: &EgressIdentity) -> Option<&'a mut ProxyEntry> {
    let url = identity.proxy_url()?;
    entries.iter_mut().find(|e| e.url == url)
}

/// Round-robin pool of egress identities with per-identity cool-down.
///
/// An empty pool always leases [`EgressIdentity::Direct`]. With
/// `direct_fallback`, `Direct` is also leased when every proxy is cooling.
#[derive(Debug)]
pub struct ProxyManager {
    direct_fallback: bool,
    state: Mutex<PoolState>,
}

impl ProxyManager {
    pub fn new<I, S>(urls: I, direct_fallback: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<ProxyEntry> = Vec::new();
        for url in urls {
            let url = url.into().trim().to_string();
            if url.is_empty() || entries.iter().any(|e| e.url == url) {
                continue;
            }
            entries.push(ProxyEntry {
                url,
                cooling_until: None,
                stats: IdentityStats::default(),
            });
        }
        Self {
            direct_fallback,
            state: Mutex::new(PoolState {
                entries,
                ..PoolState::default()
            }),
        }
    }

    /// Loads one proxy URL per line. A missing file yields an empty pool.
    pub async fn from_file(path: &Path, direct_fallback: bool) -> io::Result<Self> {
        Ok(Self::new(load_proxy_list(path).await?, direct_fallback))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn lease_identity(&self) -> Result<EgressIdentity, ProxyError> {
        let mut state = self.state.lock().await;
        if state.entries.is_empty() {
            return Ok(EgressIdentity::Direct);
        }

        let now = Instant::now();
        let count = state.entries.len();
        for step in 0..count {
            let idx = (state.cursor + step) % count;
            let entry = &mut state.entries[idx];
            match entry.cooling_until {
                Some(until) if until > now => continue,
                Some(_) => entry.cooling_until = None,
                None => {}
            }
            let identity = EgressIdentity::Proxy(entry.url.clone());
            state.cursor = (idx + 1) % count;
            return Ok(identity);
        }

        if self.direct_fallback {
            warn!(cooling = count, "all proxies cooling down; falling back to direct egress");
            return Ok(EgressIdentity::Direct);
        }
        Err(ProxyError::NoHealthyIdentity { cooling: count })
    }

    pub async fn mark_failed(&self, identity: &EgressIdentity, cool_down: Duration) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match find_entry(&mut state.entries, identity) {
            Some(entry) => {
                entry.stats.record_failure();
                entry.cooling_until = Some(Instant::now() + cool_down);
                warn!(
                    identity = %identity,
                    cool_down_secs = cool_down.as_secs(),
                    consecutive_failures = entry.stats.consecutive_failures,
                    "identity cooling down"
                );
            }
            None => state.direct.record_failure(),
        }
    }

    pub async fn mark_healthy(&self, identity: &EgressIdentity) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match find_entry(&mut state.entries, identity) {
            Some(entry) => {
                entry.stats.record_success();
                entry.cooling_until = None;
            }
            None => state.direct.record_success(),
        }
    }

    pub async fn observe_latency(&self, identity: &EgressIdentity, latency: Duration) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let stats = match find_entry(&mut state.entries, identity) {
            Some(entry) => &mut entry.stats,
            None => &mut state.direct,
        };
        stats.total_latency = stats.total_latency.saturating_add(latency);
        stats.latency_samples = stats.latency_samples.saturating_add(1);
    }

    /// Per-identity health keyed by proxy URL, plus `direct` once it has been used.
    pub async fn diagnostic_snapshot(&self) -> BTreeMap<String, ProxyDiagnostic> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut snapshot: BTreeMap<String, ProxyDiagnostic> = state
            .entries
            .iter()
            .map(|e| (e.url.clone(), e.stats.diagnostic(e.cooling_until, now)))
            .collect();
        let direct_used = state.direct.successes + state.direct.failures > 0;
        if state.entries.is_empty() || direct_used {
            snapshot.insert(
                EgressIdentity::Direct.to_string(),
                state.direct.diagnostic(None, now),
            );
        }
        snapshot
    }
}

/// Reads a proxy list file; a missing file is an empty list.
pub async fn load_proxy_list(path: &Path) -> io::Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let urls = parse_proxy_list(&text);
            info!(path = %path.display(), proxies = urls.len(), "loaded proxy list");
            Ok(urls)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "proxy list not found");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

/// One identity per line; blank lines and `#` comments are ignored.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn proxy(url: &str) -> EgressIdentity {
        EgressIdentity::Proxy(url.to_string())
    }

    #[tokio::test]
    async fn empty_pool_leases_direct() {
        let manager = ProxyManager::new(Vec::<String>::new(), false);
        assert_eq!(manager.lease_identity().await.unwrap(), EgressIdentity::Direct);
        manager.mark_failed(&EgressIdentity::Direct, Duration::from_secs(60)).await;
        assert_eq!(manager.lease_identity().await.unwrap(), EgressIdentity::Direct);
    }

    #[tokio::test]
    async fn rotates_round_robin() {
        let manager = ProxyManager::new(["http://a:1", "http://b:1", "http://a:1"], false);
        assert_eq!(manager.len().await, 2);
        let leased: Vec<_> = [
            manager.lease_identity().await.unwrap(),
            manager.lease_identity().await.unwrap(),
            manager.lease_identity().await.unwrap(),
        ]
        .to_vec();
        assert_eq!(leased, vec![proxy("http://a:1"), proxy("http://b:1"), proxy("http://a:1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_identities_are_skipped_until_cool_down_ends() {
        let manager = ProxyManager::new(["http://a:1", "http://b:1"], false);
        manager.mark_failed(&proxy("http://a:1"), Duration::from_secs(30)).await;

        for _ in 0..3 {
            assert_eq!(manager.lease_identity().await.unwrap(), proxy("http://b:1"));
        }

        manager.mark_failed(&proxy("http://b:1"), Duration::from_secs(60)).await;
        assert_eq!(
            manager.lease_identity().await,
            Err(ProxyError::NoHealthyIdentity { cooling: 2 })
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.lease_identity().await.unwrap(), proxy("http://a:1"));
        assert_eq!(manager.lease_identity().await.unwrap(), proxy("http://a:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_fallback_when_everything_cools() {
        let manager = ProxyManager::new(["http://a:1"], true);
        manager.mark_failed(&proxy("http://a:1"), Duration::from_secs(30)).await;
        assert_eq!(manager.lease_identity().await.unwrap(), EgressIdentity::Direct);

        manager.mark_healthy(&proxy("http://a:1")).await;
        assert_eq!(manager.lease_identity().await.unwrap(), proxy("http://a:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_report_rates_and_cool_down() {
        let manager = ProxyManager::new(["http://a:1", "http://b:1"], false);
        let a = proxy("http://a:1");
        manager.mark_healthy(&a).await;
        manager.observe_latency(&a, Duration::from_millis(100)).await;
        manager.observe_latency(&a, Duration::from_millis(300)).await;
        manager.mark_failed(&a, Duration::from_secs(10)).await;

        let snapshot = manager.diagnostic_snapshot().await;
        assert_eq!(snapshot.len(), 2);
        let diag = &snapshot["http://a:1"];
        assert_eq!((diag.successes, diag.failures), (1, 1));
        assert_eq!(diag.error_rate, 0.5);
        assert_eq!(diag.avg_latency_ms, 200.0);
        assert!(!diag.healthy);
        assert_eq!(diag.cooling_down_secs, 10);
        assert!(snapshot["http://b:1"].healthy);
    }

    #[tokio::test]
    async fn loads_list_file_and_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "# pool\nhttp://a:1\n\n  http://b:1  \n#http://c:1\n").unwrap();

        let manager = ProxyManager::from_file(&path, false).await.unwrap();
        assert_eq!(manager.len().await, 2);

        let missing = ProxyManager::from_file(&dir.path().join("nope.txt"), false)
            .await
            .unwrap();
        assert!(missing.is_empty().await);
        assert!(missing.diagnostic_snapshot().await.contains_key("direct"));
    }
}
