pub mod encode;
pub mod health;
pub mod server;

pub use health::HealthMetrics;
pub use server::MetricsServer;

/// Name of the sentinel reported in place of metrics when a pass fails.
pub const ERROR_METRIC: &str = "azure_error";
pub const ERROR_HELP: &str = "Error collecting metrics";
