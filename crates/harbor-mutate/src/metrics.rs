//! Prometheus metrics for the mapping cache and the pod mutator
//!
//! Metrics live in their own [`Registry`] so that tests and embedders never
//! share state through a global. [`metrics_router`] serves them in the text
//! exposition format on `GET /metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tracing::error;

use crate::error::{Error, Result};

/// Path the metrics endpoint is served on
pub const METRICS_PATH: &str = "/metrics";

/// Metrics recorded by the webhook
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Refreshes that published a new snapshot
    pub refresh_success: IntCounter,
    /// Refreshes that failed and kept the previous snapshot
    pub refresh_failure: IntCounter,
    /// Registry mappings in the current snapshot
    pub mappings: IntGauge,
    /// Container images rewritten onto Harbor
    ///
    /// Labels:
    /// - `container_kind`: containers, initContainers
    pub images_rewritten: IntCounterVec,
}

impl Metrics {
    /// Register all metrics in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            refresh_success: register_int_counter_with_registry!(
                Opts::new(
                    "harbor_webhook_refresh_success_total",
                    "Registry mapping refreshes that completed"
                ),
                registry
            )?,
            refresh_failure: register_int_counter_with_registry!(
                Opts::new(
                    "harbor_webhook_refresh_failure_total",
                    "Registry mapping refreshes that failed"
                ),
                registry
            )?,
            mappings: register_int_gauge_with_registry!(
                Opts::new(
                    "harbor_webhook_registry_mappings",
                    "Upstream registries with a Harbor proxy-cache project"
                ),
                registry
            )?,
            images_rewritten: register_int_counter_vec_with_registry!(
                Opts::new(
                    "harbor_webhook_images_rewritten_total",
                    "Container images rewritten to pull through Harbor"
                ),
                &["container_kind"],
                registry
            )?,
            registry,
        })
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics {
            message: e.to_string(),
        })
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("refresh_success", &self.refresh_success.get())
            .field("refresh_failure", &self.refresh_failure.get())
            .field("mappings", &self.mappings.get())
            .finish_non_exhaustive()
    }
}

/// Create the metrics router
///
/// - GET /metrics - Prometheus scrape endpoint
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
