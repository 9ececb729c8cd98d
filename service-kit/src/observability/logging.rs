use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::LogConfig, error::Error};

/// Installs the global subscriber: env filter, JSON output with file and line,
/// and an OTLP exporter when `otlp_endpoint` is set.
///
/// `RUST_LOG` overrides `log_level`. Must be called from within a Tokio
/// runtime when an OTLP endpoint is given.
pub fn init_tracing(
    service_name: &str,
    log_level: &str,
    otlp_endpoint: Option<&str>,
) -> Result<(), Error> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .json()
        .flatten_event(true);

    let telemetry = match otlp_endpoint.filter(|endpoint| !endpoint.is_empty()) {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                ])))
                .install_batch(runtime::Tokio)
                .map_err(|err| {
                    Error::Config(format!(
                        "failed to initialize OTLP tracer for '{service_name}' at '{endpoint}': {err}"
                    ))
                })?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| Error::Config(format!("failed to install tracing subscriber: {err}")))
}

/// [`init_tracing`] driven by a loaded [`LogConfig`].
pub fn init_from_config(cfg: &LogConfig) -> Result<(), Error> {
    init_tracing(&cfg.service_name, &cfg.level, cfg.otlp_endpoint.as_deref())
}
