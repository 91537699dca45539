//! Request instrumentation without a real server: every simulated request
//! bumps a counter, records its duration and asks for a flush.
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use opentelemetry_relay::{
    labels, names, unit, CounterHandle, ExporterClient, ExporterResult, GaugeHandle,
    HistogramHandle, Labels, MetricsRelay, RelayConfig,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DURATION_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Exporter client that prints what a real backend would receive.
#[derive(Debug, Default)]
struct StdoutClient {
    flushes: Mutex<u64>,
}

struct StdoutInstrument(String);

impl CounterHandle for StdoutInstrument {
    fn add(&self, delta: u64, labels: &Labels) {
        println!("counter   {} {:?} += {}", self.0, labels, delta);
    }
}

impl GaugeHandle for StdoutInstrument {
    fn set(&self, value: f64, labels: &Labels) {
        println!("gauge     {} {:?} = {}", self.0, labels, value);
    }
}

impl HistogramHandle for StdoutInstrument {
    fn record(&mut self, value: f64, labels: &Labels) {
        println!("histogram {} {:?} <- {:.4}", self.0, labels, value);
    }
}

impl ExporterClient for StdoutClient {
    fn create_counter(&self, name: &str, _unit: &str) -> ExporterResult<Box<dyn CounterHandle>> {
        Ok(Box::new(StdoutInstrument(name.to_owned())))
    }

    fn create_gauge(&self, name: &str, _unit: &str) -> ExporterResult<Box<dyn GaugeHandle>> {
        Ok(Box::new(StdoutInstrument(name.to_owned())))
    }

    fn create_histogram(
        &self,
        name: &str,
        _unit: &str,
        _buckets: &[f64],
    ) -> ExporterResult<Box<dyn HistogramHandle>> {
        Ok(Box::new(StdoutInstrument(name.to_owned())))
    }

    fn flush(&self) -> ExporterResult {
        let mut flushes = self.flushes.lock().unwrap_or_else(|e| e.into_inner());
        *flushes += 1;
        println!("flush #{}", *flushes);
        Ok(())
    }

    fn close(&self) -> ExporterResult {
        println!("client closed");
        Ok(())
    }
}

fn handle_request(relay: &MetricsRelay, method: &str, route: &str, work: Duration) {
    let start = Instant::now();
    thread::sleep(work);
    let status = if route == "/missing" { "404" } else { "200" };

    let request_labels = labels([("method", method), ("route", route), ("status", status)]);
    relay.increment_counter(
        names::HTTP_SERVER_REQUESTS_TOTAL,
        unit::REQUEST,
        request_labels.clone(),
    );
    relay.record_histogram(
        start.elapsed().as_secs_f64(),
        names::HTTP_SERVER_REQUEST_DURATION,
        unit::SECONDS,
        &DURATION_BUCKETS,
        request_labels,
    );
    relay.request_flush();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new("opentelemetry=debug"));
    tracing_subscriber::registry().with(fmt_layer).init();

    let config = RelayConfig::builder()
        .with_service_name("http-requests")
        .with_send_interval(Duration::from_secs(1))
        .with_min_send_interval(Duration::from_millis(50))
        .build()?;
    let relay = MetricsRelay::new(config, Arc::new(StdoutClient::default()))?;

    let inflight = relay.gauge("http.server.active_requests", unit::REQUEST, Labels::new())?;
    thread::scope(|s| {
        for worker in 0..4u64 {
            let relay = &relay;
            let inflight = &inflight;
            s.spawn(move || {
                for i in 0..5u64 {
                    let (method, route) = match (worker + i) % 3 {
                        0 => ("GET", "/orders"),
                        1 => ("POST", "/orders"),
                        _ => ("GET", "/missing"),
                    };
                    inflight.inc();
                    handle_request(relay, method, route, Duration::from_millis(5 * (i + 1)));
                    inflight.dec();
                }
            });
        }
    });

    println!("health: {:?}", relay.health());
    relay.close()?;
    Ok(())
}
