//! Metric names and Prometheus export.
//!
//! Library code records through the `metrics` facade only; binaries pick an
//! exporter with [`init_metrics`] or [`install_prometheus_recorder`].

use std::{net::SocketAddr, sync::OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::Error;

/// Histogram of items per dispatched batch, labelled by `batcher`.
pub const BATCH_SIZE: &str = "service_kit_batch_size";
/// Counter of refresh attempts, labelled by `client` and `outcome`.
pub const CLIENT_REFRESH_TOTAL: &str = "service_kit_client_refresh_total";
/// Counter of JSON-RPC HTTP round trips, labelled by `kind` and `outcome`.
pub const RPC_REQUESTS_TOTAL: &str = "service_kit_rpc_requests_total";
pub const RPC_REQUEST_DURATION_SECONDS: &str = "service_kit_rpc_request_duration_seconds";
/// Counter of batched `eth_call` retries, labelled by `lane`.
pub const ETH_BATCH_RETRIES_TOTAL: &str = "service_kit_eth_batch_retries_total";
/// Counter of batches that failed for good, labelled by `lane`.
pub const ETH_BATCH_FAILURES_TOTAL: &str = "service_kit_eth_batch_failures_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs a global Prometheus recorder whose output is served by the
/// application itself through [`render_metrics`].
pub fn init_metrics() -> Result<(), Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| Error::Config(format!("failed to install prometheus recorder: {err}")))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| Error::Config("metrics recorder already initialized".into()))
}

/// Current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Installs a global Prometheus recorder with its own scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn install_prometheus_recorder(addr: SocketAddr) -> Result<(), Error> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| Error::Config(format!("failed to install prometheus exporter on {addr}: {err}")))
}
