pub mod logging;
pub mod metrics;
pub mod trace_context;

pub use logging::{init_from_config, init_tracing};
pub use metrics::{init_metrics, install_prometheus_recorder, render_metrics};
pub use trace_context::{
    CLIENT_ID_HEADER, REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER,
    inject_trace_context, propagation_headers,
};
