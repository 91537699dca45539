use std::error::Error;
use std::sync::Arc;

use opentelemetry_relay::{labels, unit, MetricsRelay, OtelExporterClient, RelayConfig};
use opentelemetry_sdk::metrics::InMemoryMetricExporter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    // Show the relay's own diagnostics, `debug` and above.
    let filter_fmt = EnvFilter::new("info").add_directive("opentelemetry=debug".parse()?);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(filter_fmt);
    tracing_subscriber::registry().with(fmt_layer).init();

    let config = RelayConfig::builder()
        .with_service_name("simple-usage")
        .with_service_version(env!("CARGO_PKG_VERSION"))
        .build()?;

    let exporter = InMemoryMetricExporter::default();
    let client = OtelExporterClient::builder(exporter.clone())
        .with_config(&config)
        .build();
    let relay = MetricsRelay::new(config, Arc::new(client))?;

    let jobs = relay.counter("jobs.processed", unit::REQUEST, labels([("queue", "default")]))?;
    for _ in 0..10 {
        jobs.inc();
    }
    println!("jobs processed: {}", jobs.get());

    let memory = relay.gauge("memory.usage", unit::BYTES, labels([("area", "heap")]))?;
    memory.set(64.0 * 1024.0 * 1024.0);
    memory.add(4096.0);
    println!("memory usage: {} bytes", memory.get());

    let latency = relay.histogram(
        "job.duration",
        unit::SECONDS,
        &[0.01, 0.05, 0.1, 0.5, 1.0],
        labels([("queue", "default")]),
    )?;
    for seconds in [0.004, 0.07, 0.2, 0.9] {
        latency.record(seconds);
    }

    relay.flush_sync()?;
    let exported = exporter
        .get_finished_metrics()
        .map(|metrics| metrics.len())
        .unwrap_or_default();
    println!("exported {exported} batch(es) of resource metrics");
    println!("health: {:?}", relay.health());

    relay.close()?;
    Ok(())
}
