//! Observability utilities: tracing setup and Prometheus metrics.

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;
