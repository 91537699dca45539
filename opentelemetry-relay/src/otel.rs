//! [`ExporterClient`] backed by the OpenTelemetry SDK.
//!
//! The client owns its [`SdkMeterProvider`]; it is never installed as the
//! global provider. Instruments are built on a meter scoped to this crate and
//! exported by a [`PeriodicReader`], so `flush` maps to
//! [`SdkMeterProvider::force_flush`] and `close` to
//! [`SdkMeterProvider::shutdown`].
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;

use crate::config::{
    RelayConfig, OTEL_RELAY_ENVIRONMENT_DEFAULT, OTEL_RELAY_SEND_INTERVAL_DEFAULT,
    OTEL_RELAY_SERVICE_VERSION_DEFAULT, OTEL_SERVICE_NAME_DEFAULT,
};
use crate::error::{ExporterError, ExporterResult};
use crate::exporter::{CounterHandle, ExporterClient, GaugeHandle, HistogramHandle};
use crate::key::Labels;
use crate::relay_debug;

// maximum length of instrument name
const INSTRUMENT_NAME_MAX_LENGTH: usize = 255;
// maximum length of instrument unit name
const INSTRUMENT_UNIT_NAME_MAX_LENGTH: usize = 63;
const INSTRUMENT_NAME_ALLOWED_NON_ALPHANUMERIC_CHARS: [char; 4] = ['_', '.', '-', '/'];

// instrument validation error strings
const INSTRUMENT_NAME_EMPTY: &str = "instrument name must be non-empty";
const INSTRUMENT_NAME_LENGTH: &str = "instrument name must be less than 256 characters";
const INSTRUMENT_NAME_INVALID_CHAR: &str =
    "characters in instrument name must be ASCII and belong to the alphanumeric characters, '_', '.', '-' and '/'";
const INSTRUMENT_NAME_FIRST_ALPHABETIC: &str =
    "instrument name must start with an alphabetic character";
const INSTRUMENT_UNIT_LENGTH: &str = "instrument unit must be less than 64 characters";
const INSTRUMENT_UNIT_INVALID_CHAR: &str = "characters in instrument unit must be ASCII";

const SCOPE_NAME: &str = "opentelemetry-relay";
const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment.name";

/// Builds metric instruments on an owned [`SdkMeterProvider`].
///
/// # Example
///
/// ```no_run
/// use opentelemetry_relay::{OtelExporterClient, RelayConfig};
/// use opentelemetry_sdk::metrics::InMemoryMetricExporter;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RelayConfig::builder().with_service_name("checkout").build()?;
/// let client = OtelExporterClient::builder(InMemoryMetricExporter::default())
///     .with_config(&config)
///     .build();
/// # Ok(())
/// # }
/// ```
pub struct OtelExporterClient {
    provider: SdkMeterProvider,
    meter: Meter,
    is_shutdown: AtomicBool,
}

impl fmt::Debug for OtelExporterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelExporterClient")
            .field("provider", &self.provider)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl OtelExporterClient {
    /// Starts building a client that exports through `exporter`.
    pub fn builder<E>(exporter: E) -> OtelExporterClientBuilder<E>
    where
        E: PushMetricExporter,
    {
        OtelExporterClientBuilder {
            exporter,
            service_name: OTEL_SERVICE_NAME_DEFAULT.to_owned(),
            service_version: OTEL_RELAY_SERVICE_VERSION_DEFAULT.to_owned(),
            environment: OTEL_RELAY_ENVIRONMENT_DEFAULT.to_owned(),
            interval: OTEL_RELAY_SEND_INTERVAL_DEFAULT,
        }
    }

    /// Wraps an already configured provider. The client takes over its
    /// lifecycle: closing the client shuts the provider down.
    pub fn with_meter_provider(provider: SdkMeterProvider) -> Self {
        let scope = InstrumentationScope::builder(SCOPE_NAME)
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        let meter = provider.meter_with_scope(scope);
        OtelExporterClient {
            provider,
            meter,
            is_shutdown: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> ExporterResult {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(ExporterError::AlreadyShutdown);
        }
        Ok(())
    }
}

impl ExporterClient for OtelExporterClient {
    fn create_counter(&self, name: &str, unit: &str) -> ExporterResult<Box<dyn CounterHandle>> {
        self.check_open()?;
        validate_instrument_config(name, unit)?;
        let mut builder = self.meter.u64_counter(name.to_owned());
        if !unit.is_empty() {
            builder = builder.with_unit(unit.to_owned());
        }
        Ok(Box::new(builder.build()))
    }

    fn create_gauge(&self, name: &str, unit: &str) -> ExporterResult<Box<dyn GaugeHandle>> {
        self.check_open()?;
        validate_instrument_config(name, unit)?;
        let mut builder = self.meter.f64_gauge(name.to_owned());
        if !unit.is_empty() {
            builder = builder.with_unit(unit.to_owned());
        }
        Ok(Box::new(builder.build()))
    }

    fn create_histogram(
        &self,
        name: &str,
        unit: &str,
        buckets: &[f64],
    ) -> ExporterResult<Box<dyn HistogramHandle>> {
        self.check_open()?;
        validate_instrument_config(name, unit)?;
        let mut builder = self.meter.f64_histogram(name.to_owned());
        if !unit.is_empty() {
            builder = builder.with_unit(unit.to_owned());
        }
        if !buckets.is_empty() {
            builder = builder.with_boundaries(buckets.to_vec());
        }
        Ok(Box::new(builder.build()))
    }

    fn flush(&self) -> ExporterResult {
        self.check_open()?;
        self.provider.force_flush().map_err(to_exporter_error)
    }

    fn close(&self) -> ExporterResult {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(ExporterError::AlreadyShutdown);
        }
        relay_debug!(name: "OtelExporterClient.Closing");
        self.provider.shutdown().map_err(to_exporter_error)
    }
}

/// Builder for [`OtelExporterClient`].
#[derive(Debug)]
pub struct OtelExporterClientBuilder<E> {
    exporter: E,
    service_name: String,
    service_version: String,
    environment: String,
    interval: Duration,
}

impl<E> OtelExporterClientBuilder<E>
where
    E: PushMetricExporter,
{
    /// Takes the service identity and the export interval from `config`.
    ///
    /// The service name, version and environment become resource attributes;
    /// `send_interval` becomes the periodic export interval.
    pub fn with_config(mut self, config: &RelayConfig) -> Self {
        self.service_name = config.service_name().to_owned();
        self.service_version = config.service_version().to_owned();
        self.environment = config.environment().to_owned();
        self.interval = config.send_interval();
        self
    }

    /// Sets the periodic export interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Builds the provider and the client.
    pub fn build(self) -> OtelExporterClient {
        let resource = Resource::builder()
            .with_service_name(self.service_name)
            .with_attributes([
                KeyValue::new("service.version", self.service_version),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT, self.environment),
            ])
            .build();
        let reader = PeriodicReader::builder(self.exporter)
            .with_interval(self.interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();
        OtelExporterClient::with_meter_provider(provider)
    }
}

impl CounterHandle for opentelemetry::metrics::Counter<u64> {
    fn add(&self, delta: u64, labels: &Labels) {
        opentelemetry::metrics::Counter::add(self, delta, &attributes(labels));
    }
}

impl GaugeHandle for opentelemetry::metrics::Gauge<f64> {
    fn set(&self, value: f64, labels: &Labels) {
        self.record(value, &attributes(labels));
    }
}

impl HistogramHandle for opentelemetry::metrics::Histogram<f64> {
    fn record(&mut self, value: f64, labels: &Labels) {
        opentelemetry::metrics::Histogram::record(self, value, &attributes(labels));
    }
}

fn attributes(labels: &Labels) -> Vec<KeyValue> {
    labels
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}

fn to_exporter_error(err: OTelSdkError) -> ExporterError {
    match err {
        OTelSdkError::AlreadyShutdown => ExporterError::AlreadyShutdown,
        OTelSdkError::Timeout(timeout) => ExporterError::Timeout(timeout),
        other => ExporterError::ExportFailed(other.to_string()),
    }
}

fn validate_instrument_config(name: &str, unit: &str) -> ExporterResult {
    validate_instrument_name(name).and_then(|_| validate_instrument_unit(unit))
}

fn validate_instrument_name(name: &str) -> ExporterResult {
    if name.is_empty() {
        return Err(ExporterError::InvalidInstrument(INSTRUMENT_NAME_EMPTY.into()));
    }
    if name.len() > INSTRUMENT_NAME_MAX_LENGTH {
        return Err(ExporterError::InvalidInstrument(
            INSTRUMENT_NAME_LENGTH.into(),
        ));
    }
    if name.starts_with(|c: char| !c.is_ascii_alphabetic()) {
        return Err(ExporterError::InvalidInstrument(
            INSTRUMENT_NAME_FIRST_ALPHABETIC.into(),
        ));
    }
    if name.contains(|c: char| {
        !c.is_ascii_alphanumeric() && !INSTRUMENT_NAME_ALLOWED_NON_ALPHANUMERIC_CHARS.contains(&c)
    }) {
        return Err(ExporterError::InvalidInstrument(
            INSTRUMENT_NAME_INVALID_CHAR.into(),
        ));
    }
    Ok(())
}

fn validate_instrument_unit(unit: &str) -> ExporterResult {
    if unit.len() > INSTRUMENT_UNIT_NAME_MAX_LENGTH {
        return Err(ExporterError::InvalidInstrument(
            INSTRUMENT_UNIT_LENGTH.into(),
        ));
    }
    if unit.contains(|c: char| !c.is_ascii()) {
        return Err(ExporterError::InvalidInstrument(
            INSTRUMENT_UNIT_INVALID_CHAR.into(),
        ));
    }
    Ok(())
}
