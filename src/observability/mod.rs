//! Observability for device connections: structured logging and metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};

pub use logging::{device_span, pipeline_span};
