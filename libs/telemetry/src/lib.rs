//! Lightweight facade around tracing setup and metric emission.
//!
//! ```no_run
//! use baler_telemetry::{TelemetryConfig, init_telemetry};
//!
//! # fn main() -> anyhow::Result<()> {
//! init_telemetry(TelemetryConfig {
//!     service_name: "baler-aggregator".into(),
//!     environment: "local".into(),
//!     log_level: "info".into(),
//!     json_logs: false,
//! })?;
//! tracing::info!("telemetry configured");
//! Ok(())
//! # }
//! ```

mod metrics;
mod tracing_init;

pub use metrics::{TelemetryLabels, record_counter, record_gauge, record_histogram};
pub use tracing_init::{TelemetryConfig, init_telemetry};
