//! Interfaces consumed from the exporter client.
//!
//! The relay does not speak any wire protocol. It asks an [`ExporterClient`]
//! to build backend-side instruments once per [`MetricKey`], forwards every
//! mutation to the handle it got back, and asks the client to flush.
//!
//! [`MetricKey`]: crate::MetricKey
use std::fmt::Debug;

use crate::error::ExporterResult;
use crate::key::Labels;

/// Backend-side counter. Receives deltas, never absolute values.
pub trait CounterHandle: Send + Sync {
    /// Adds `delta` to the counter stream identified by `labels`.
    fn add(&self, delta: u64, labels: &Labels);
}

/// Backend-side gauge. Receives absolute values.
pub trait GaugeHandle: Send + Sync {
    /// Sets the gauge stream identified by `labels` to `value`.
    fn set(&self, value: f64, labels: &Labels);
}

/// Backend-side histogram.
///
/// Only `Send` is required: the relay serializes every call to a histogram
/// handle behind the owning primitive's lock.
pub trait HistogramHandle: Send {
    /// Records `value` in the histogram stream identified by `labels`.
    fn record(&mut self, value: f64, labels: &Labels);
}

/// Converts metric state to a wire format and delivers it.
///
/// Implementations must be safe to call from many threads. Instrument
/// construction is expected to be fast and local; it runs while the
/// registry holds its write lock.
pub trait ExporterClient: Send + Sync + Debug + 'static {
    /// Builds a counter instrument.
    fn create_counter(&self, name: &str, unit: &str) -> ExporterResult<Box<dyn CounterHandle>>;

    /// Builds a gauge instrument.
    fn create_gauge(&self, name: &str, unit: &str) -> ExporterResult<Box<dyn GaugeHandle>>;

    /// Builds a histogram instrument with explicit bucket boundaries. An
    /// empty `buckets` slice asks for the backend defaults.
    fn create_histogram(
        &self,
        name: &str,
        unit: &str,
        buckets: &[f64],
    ) -> ExporterResult<Box<dyn HistogramHandle>>;

    /// Delivers the accumulated state now.
    ///
    /// A failed flush must leave the accumulated state in place so that the
    /// next flush delivers it.
    fn flush(&self) -> ExporterResult;

    /// Releases the resources held by the client. After this call, creation
    /// and flush calls return [`ExporterError::AlreadyShutdown`].
    ///
    /// [`ExporterError::AlreadyShutdown`]: crate::ExporterError::AlreadyShutdown
    fn close(&self) -> ExporterResult;
}
