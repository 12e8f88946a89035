//! HTTP exporter for Prometheus metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::instrumenter::PrometheusInstrumenter;
use crate::error::Result;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves the instrumenter's registry over HTTP.
pub struct MetricsExporter {
    addr: SocketAddr,
    path: String,
    instrumenter: Arc<PrometheusInstrumenter>,
}

impl MetricsExporter {
    pub fn new(addr: SocketAddr, path: impl Into<String>, instrumenter: Arc<PrometheusInstrumenter>) -> Self {
        Self {
            addr,
            path: path.into(),
            instrumenter,
        }
    }

    /// Create the router. Only the metrics path is served; anything else is a 404.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(metrics_handler))
            .with_state(self.instrumenter.clone())
    }

    /// Serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, path = %self.path, "Metrics exporter listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await?;

        info!("Metrics exporter stopped");
        Ok(())
    }
}

async fn metrics_handler(State(instrumenter): State<Arc<PrometheusInstrumenter>>) -> Response {
    match instrumenter.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Instrumenter;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn exporter() -> (MetricsExporter, Arc<PrometheusInstrumenter>) {
        let instrumenter = Arc::new(PrometheusInstrumenter::new());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (
            MetricsExporter::new(addr, "/metrics", instrumenter.clone()),
            instrumenter,
        )
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (exporter, instrumenter) = exporter();
        instrumenter.count_error("unknown");

        let request = Request::builder()
            .method("GET")
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let response = exporter.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("divvy_errors_total{code=\"unknown\"} 1"));
    }

    #[tokio::test]
    async fn test_other_paths_not_found() {
        let (exporter, _) = exporter();

        let request = Request::builder()
            .method("GET")
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = exporter.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
