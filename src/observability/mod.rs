pub mod metrics;
pub mod tracing;

pub use metrics::{MetricsRegistry, Operation};
pub use self::tracing::init_tracing;
