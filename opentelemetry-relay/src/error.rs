//! Errors returned by the relay and by exporter clients.
use std::result;
use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

use crate::instrument::InstrumentKind;

/// A specialized `Result` type for registry, pipeline and relay operations.
pub type MetricResult<T> = result::Result<T, MetricError>;

/// A specialized `Result` type for [`ExporterClient`](crate::exporter::ExporterClient) operations.
pub type ExporterResult<T = ()> = result::Result<T, ExporterError>;

/// Errors reported by an exporter client.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExporterError {
    /// The client refused to build an instrument, e.g. because its name is
    /// empty or contains characters the backend does not accept.
    #[error("Invalid instrument configuration: {0}")]
    InvalidInstrument(String),

    /// Delivering the accumulated metric state to the backend failed.
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// The operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The client was already closed.
    #[error("Exporter client is already shut down")]
    AlreadyShutdown,

    /// Any other failure inside the client.
    #[error("Internal failure: {0}")]
    InternalFailure(String),
}

/// Errors returned by the registry, the delivery pipeline and the relay.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetricError {
    /// The exporter client rejected the construction of an instrument. No
    /// primitive was cached for the key, a later call retries the creation.
    #[error("Failed to create {kind} `{name}`: {source}")]
    CreationFailed {
        /// Kind of the instrument that was requested.
        kind: InstrumentKind,
        /// Name of the instrument that was requested.
        name: String,
        /// Error reported by the exporter client.
        #[source]
        source: ExporterError,
    },

    /// A histogram was requested with more bucket boundaries than allowed.
    #[error("Histogram has {count} buckets, at most {max} are allowed")]
    TooManyBuckets {
        /// Number of boundaries that were requested.
        count: usize,
        /// Maximum number of boundaries.
        max: usize,
    },

    /// A synchronous flush failed. Asynchronous flush failures are only logged.
    #[error("Flush failed: {0}")]
    ExportFailed(#[source] ExporterError),

    /// The component was already closed.
    #[error("Already shut down")]
    AlreadyShutdown,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Other errors not covered by specific cases.
    #[error("Metrics error: {0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for MetricError {
    fn from(err: PoisonError<T>) -> Self {
        MetricError::Other(err.to_string())
    }
}

impl From<ExporterError> for MetricError {
    fn from(err: ExporterError) -> Self {
        match err {
            ExporterError::AlreadyShutdown => MetricError::AlreadyShutdown,
            other => MetricError::ExportFailed(other),
        }
    }
}
