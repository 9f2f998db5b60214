//! Observability utilities (metrics + tracing).

mod metrics;
mod tracing;

pub use metrics::MetricsContext;
pub use tracing::{init_tracing, ColorWhen};
