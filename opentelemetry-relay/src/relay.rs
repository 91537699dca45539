//! Application-facing facade.
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::error::{MetricError, MetricResult};
use crate::exporter::ExporterClient;
use crate::instrument::{Counter, Gauge, Histogram};
use crate::key::Labels;
use crate::pipeline::DeliveryPipeline;
use crate::registry::InstrumentRegistry;
use crate::{relay_debug, relay_warn};

/// Label carrying the configured service name.
pub const SERVICE_NAME_LABEL: &str = "service.name";
/// Label carrying the configured deployment environment.
pub const ENVIRONMENT_LABEL: &str = "environment";

/// Health and introspection data of a [`MetricsRelay`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Flush requests refused by both the signal queue and the overflow pool.
    pub dropped_requests: u64,
    /// Overflow flush jobs in flight.
    pub pool_running: usize,
    /// Overflow flush jobs that can still be accepted.
    pub pool_free: usize,
    /// Maximum number of overflow flush jobs in flight.
    pub pool_capacity: usize,
    /// Number of primitives cached by the registry, all kinds included.
    pub metrics_count: usize,
}

/// An [`InstrumentRegistry`] and a [`DeliveryPipeline`] sharing one
/// [`ExporterClient`].
///
/// Every primitive obtained through the relay carries two extra labels,
/// `service.name` and `environment`, taken from the [`RelayConfig`]. They
/// replace caller labels with the same keys.
///
/// # Example
///
/// ```
/// # #[cfg(feature = "testing")]
/// # {
/// # use std::sync::Arc;
/// use opentelemetry_relay::testing::InMemoryExporterClient;
/// use opentelemetry_relay::{labels, unit, MetricsRelay, RelayConfig};
///
/// let config = RelayConfig::builder().with_service_name("checkout").build().unwrap();
/// let relay = MetricsRelay::new(config, Arc::new(InMemoryExporterClient::default())).unwrap();
///
/// relay.increment_counter("orders.placed", unit::REQUEST, labels([("region", "eu")]));
/// relay.request_flush();
///
/// assert_eq!(relay.health().metrics_count, 1);
/// relay.close().unwrap();
/// # }
/// ```
#[derive(Debug)]
pub struct MetricsRelay {
    config: RelayConfig,
    registry: InstrumentRegistry,
    pipeline: DeliveryPipeline,
}

impl MetricsRelay {
    /// Creates a relay and starts its delivery pipeline.
    pub fn new(config: RelayConfig, client: Arc<dyn ExporterClient>) -> MetricResult<Self> {
        let pipeline = DeliveryPipeline::new(Arc::clone(&client), &config)?;
        relay_debug!(
            name: "MetricsRelay.Created",
            service_name = config.service_name().to_owned(),
            environment = config.environment().to_owned()
        );
        Ok(MetricsRelay {
            registry: InstrumentRegistry::new(client),
            pipeline,
            config,
        })
    }

    /// Returns the counter for `name` and `labels`, creating it on first use.
    pub fn counter(&self, name: &str, unit: &str, labels: Labels) -> MetricResult<Arc<Counter>> {
        self.registry
            .get_or_create_counter(name, unit, self.with_default_labels(labels))
    }

    /// Returns the gauge for `name` and `labels`, creating it on first use.
    pub fn gauge(&self, name: &str, unit: &str, labels: Labels) -> MetricResult<Arc<Gauge>> {
        self.registry
            .get_or_create_gauge(name, unit, self.with_default_labels(labels))
    }

    /// Returns the histogram for `name` and `labels`, creating it on first use.
    pub fn histogram(
        &self,
        name: &str,
        unit: &str,
        buckets: &[f64],
        labels: Labels,
    ) -> MetricResult<Arc<Histogram>> {
        self.registry
            .get_or_create_histogram(name, unit, buckets, self.with_default_labels(labels))
    }

    /// Increments a counter by one. Creation errors are logged and dropped.
    pub fn increment_counter(&self, name: &str, unit: &str, labels: Labels) {
        self.add_to_counter(1, name, unit, labels);
    }

    /// Adds `delta` to a counter. Creation errors are logged and dropped.
    pub fn add_to_counter(&self, delta: u64, name: &str, unit: &str, labels: Labels) {
        match self.counter(name, unit, labels) {
            Ok(counter) => {
                counter.add(delta);
            }
            Err(err) => report_dropped_update(name, &err),
        }
    }

    /// Sets a gauge. Creation errors are logged and dropped.
    pub fn set_gauge(&self, value: f64, name: &str, unit: &str, labels: Labels) {
        match self.gauge(name, unit, labels) {
            Ok(gauge) => gauge.set(value),
            Err(err) => report_dropped_update(name, &err),
        }
    }

    /// Records a histogram observation. Creation errors are logged and dropped.
    pub fn record_histogram(
        &self,
        value: f64,
        name: &str,
        unit: &str,
        buckets: &[f64],
        labels: Labels,
    ) {
        match self.histogram(name, unit, buckets, labels) {
            Ok(histogram) => histogram.record(value),
            Err(err) => report_dropped_update(name, &err),
        }
    }

    /// Asks for a flush without blocking. See [`DeliveryPipeline::request_flush`].
    pub fn request_flush(&self) {
        self.pipeline.request_flush();
    }

    /// Flushes on the calling thread. See [`DeliveryPipeline::flush_sync`].
    pub fn flush_sync(&self) -> MetricResult<()> {
        self.pipeline.flush_sync()
    }

    /// Current health counters.
    pub fn health(&self) -> HealthSnapshot {
        let stats = self.pipeline.stats();
        HealthSnapshot {
            dropped_requests: stats.dropped_requests,
            pool_running: stats.pool_running,
            pool_free: stats.pool_free,
            pool_capacity: stats.pool_capacity,
            metrics_count: self.registry.len(),
        }
    }

    /// The configuration the relay was built with.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The underlying registry.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Stops the delivery pipeline after a final flush, then closes the
    /// registry and the exporter client.
    ///
    /// If the pipeline does not stop within `shutdown_timeout`, the registry
    /// refuses further lookups but the exporter client is left open for the
    /// flushes still running, and the timeout error is returned. A second
    /// call returns [`MetricError::AlreadyShutdown`].
    pub fn close(&self) -> MetricResult<()> {
        match self.pipeline.shutdown() {
            Ok(()) => self.registry.close(),
            Err(MetricError::AlreadyShutdown) => Err(MetricError::AlreadyShutdown),
            Err(err) => {
                relay_warn!(
                    name: "MetricsRelay.PipelineShutdownFailed",
                    error = format!("{err}"),
                    message = "Flushes are still running; the exporter client is left open."
                );
                let _ = self.registry.close_without_client();
                Err(err)
            }
        }
    }

    fn with_default_labels(&self, mut labels: Labels) -> Labels {
        labels.insert(
            SERVICE_NAME_LABEL.to_owned(),
            self.config.service_name().to_owned(),
        );
        labels.insert(
            ENVIRONMENT_LABEL.to_owned(),
            self.config.environment().to_owned(),
        );
        labels
    }
}

impl Drop for MetricsRelay {
    fn drop(&mut self) {
        if !self.pipeline.is_shutdown() {
            let _ = self.close();
        }
    }
}

fn report_dropped_update(name: &str, err: &MetricError) {
    relay_warn!(
        name: "MetricsRelay.UpdateDropped",
        instrument = name.to_owned(),
        error = format!("{err}")
    );
}
