use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::encode::{encode_text, observation_families};
use super::health::HealthMetrics;
use super::{ERROR_HELP, ERROR_METRIC};
use crate::collector::MetricsCollector;

const DEFAULT_LISTEN_ADDRESS: &str = ":9276";

/// HTTP server exposing collected metrics. Every `/metrics` request runs
/// one collection pass.
pub struct MetricsServer<M> {
    addr: String,
    collector: Arc<M>,
    health: Arc<HealthMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl<M: MetricsCollector + 'static> MetricsServer<M> {
    pub fn new(addr: &str, collector: Arc<M>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            collector,
            health,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        let state = Arc::new(AppState {
            collector: Arc::clone(&self.collector),
            health: Arc::clone(&self.health),
        });

        Router::new()
            .route("/", get(landing_handler::<M>))
            .route("/metrics", get(metrics_handler::<M>))
            .route("/healthz", get(healthz_handler))
            .with_state(state)
    }

    /// Bind the listener and serve in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            DEFAULT_LISTEN_ADDRESS
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let app = self.router();
        tokio::spawn(async move {
            info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState<M> {
    collector: Arc<M>,
    health: Arc<HealthMetrics>,
}

/// GET /metrics - run a collection pass and answer in Prometheus text format.
async fn metrics_handler<M: MetricsCollector>(State(state): State<Arc<AppState<M>>>) -> Response {
    let start = Instant::now();
    let result = state.collector.collect().await;
    state.health.observe_scrape(&result, start.elapsed());

    let scrape = match result {
        Ok(scrape) => scrape,
        Err(e) => {
            let stage = e.stage();
            let chain = format!("{:#}", anyhow::Error::from(e));
            error!(stage, error = %chain, "collection failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "An error has occurred while serving metrics:\n\n\
                     collected metric {ERROR_METRIC} ({ERROR_HELP}) was collected with error: {chain}\n"
                ),
            )
                .into_response();
        }
    };

    let mut families = observation_families(&scrape.observations);
    families.extend(state.health.gather());

    match encode_text(&families) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

/// GET / - landing page.
async fn landing_handler<M: MetricsCollector>(
    State(state): State<Arc<AppState<M>>>,
) -> Html<String> {
    let known: String = state
        .collector
        .describe()
        .iter()
        .map(|d| format!("<li><code>{}</code>: {}</li>", d.name, d.help))
        .collect();

    Html(format!(
        "<html>\n<head><title>Azure Exporter</title></head>\n<body>\n\
         <h1>Azure Exporter</h1>\n<p><a href=\"/metrics\">Metrics</a></p>\n\
         <ul>{known}</ul>\n</body>\n</html>\n"
    ))
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
