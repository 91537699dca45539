//! # OpenTelemetry Relay
//!
//! A process-local layer between application code and a metrics exporter.
//!
//! The [`InstrumentRegistry`] hands out one shared [`Counter`], [`Gauge`] or
//! [`Histogram`] per name and label set, and asks the [`ExporterClient`] to
//! build the backing instrument exactly once for it, even when many threads
//! race on the first access. The [`DeliveryPipeline`] turns flush requests
//! into exporter flushes without ever blocking the caller: requests are
//! queued for a background worker, handed to a bounded overflow pool when the
//! queue is full, and counted as dropped when both are saturated.
//!
//! [`MetricsRelay`] wires both together over a single client and is what most
//! applications use.
//!
//! ```no_run
//! # #[cfg(feature = "otel")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use opentelemetry_relay::{labels, unit, MetricsRelay, OtelExporterClient, RelayConfig};
//! use opentelemetry_sdk::metrics::InMemoryMetricExporter;
//!
//! let config = RelayConfig::builder().with_service_name("checkout").build()?;
//! let client = OtelExporterClient::builder(InMemoryMetricExporter::default())
//!     .with_config(&config)
//!     .build();
//! let relay = MetricsRelay::new(config, Arc::new(client))?;
//!
//! let orders = relay.counter("orders.placed", unit::REQUEST, labels([("region", "eu")]))?;
//! orders.inc();
//! relay.request_flush();
//!
//! relay.close()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "otel"))]
//! # fn main() {}
//! ```
//!
//! ## Crate Feature Flags
//!
//! * `otel`: [`OtelExporterClient`], an exporter client backed by the
//!   OpenTelemetry SDK. Enabled by default.
//! * `internal-logs`: emits the relay's own diagnostics as `tracing` events.
//!   Enabled by default.
//! * `testing`: [`testing::InMemoryExporterClient`], an exporter client that
//!   records everything in memory.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

mod config;
mod error;
mod exporter;
mod instrument;
mod internal_logging;
mod key;
#[cfg(feature = "otel")]
#[cfg_attr(docsrs, doc(cfg(feature = "otel")))]
mod otel;
mod pipeline;
mod pool;
mod registry;
mod relay;
#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use config::{RelayConfig, RelayConfigBuilder};
pub use error::{ExporterError, ExporterResult, MetricError, MetricResult};
pub use exporter::{CounterHandle, ExporterClient, GaugeHandle, HistogramHandle};
pub use instrument::{names, unit, Counter, Gauge, Histogram, InstrumentKind};
pub use key::{labels, Labels, MetricKey};
#[cfg(feature = "otel")]
#[cfg_attr(docsrs, doc(cfg(feature = "otel")))]
pub use otel::{OtelExporterClient, OtelExporterClientBuilder};
pub use pipeline::{DeliveryPipeline, PipelineStats, RateLimiter};
pub use pool::{PoolError, WorkerPool};
pub use registry::{InstrumentRegistry, MAX_HISTOGRAM_BUCKETS};
pub use relay::{HealthSnapshot, MetricsRelay, ENVIRONMENT_LABEL, SERVICE_NAME_LABEL};

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
/// Re-exports used by the internal logging macros.
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
