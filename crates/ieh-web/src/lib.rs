//! Read-only diagnostic API over the live proxy pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use ieh_sync::{ProxyDiagnostic, ProxyManager};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub const CRATE_NAME: &str = "ieh-web";

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub proxies: Arc<ProxyManager>,
}

impl AppState {
    pub fn new(proxies: Arc<ProxyManager>) -> Self {
        Self { proxies }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/proxies/diagnostic", get(proxy_diagnostic_handler))
        .with_state(Arc::new(state))
}

/// `IEH_WEB_PORT`, falling back to [`DEFAULT_PORT`] when unset or unparseable.
pub fn port_from_env() -> u16 {
    std::env::var("IEH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Serves until `shutdown` carries `true`.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "diagnostic api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn proxy_diagnostic_handler(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, ProxyDiagnostic>> {
    Json(state.proxies.diagnostic_snapshot().await)
}
