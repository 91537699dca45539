/*
    Floods the delivery pipeline while the backend is stalled and checks that
    every flush request is either queued, handed to the overflow pool, or
    counted as dropped, and that none of the callers ever blocks.

    Run with `cargo run --release --bin pipeline_overflow`.
*/

use num_format::{Locale, ToFormattedString};
use opentelemetry_relay::testing::InMemoryExporterClient;
use opentelemetry_relay::{labels, unit, MetricsRelay, RelayConfig};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const BUFFER_SIZE: usize = 5;
const POOL_SIZE: usize = 10;
const THREADS: usize = 20;
const REQUESTS_PER_THREAD: usize = 10;

fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new("opentelemetry=debug"));
    tracing_subscriber::registry().with(fmt_layer).init();

    let config = RelayConfig::builder()
        .with_service_name("pipeline-overflow")
        .with_buffer_size(BUFFER_SIZE)
        .with_pool_size(POOL_SIZE)
        .with_send_interval(Duration::from_secs(3600))
        .with_min_send_interval(Duration::ZERO)
        .build()
        .expect("valid configuration");
    let client = InMemoryExporterClient::default();
    let relay = MetricsRelay::new(config, Arc::new(client.clone())).expect("relay starts");

    // Stall the backend and park the worker inside a flush.
    client.block_flushes();
    relay.request_flush();
    assert!(client.wait_for_flushes_started(1, Duration::from_secs(5)));
    println!("before: {:?}", relay.health());

    let barrier = Barrier::new(THREADS);
    let start = Instant::now();
    thread::scope(|s| {
        for worker in 0..THREADS {
            let relay = &relay;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..REQUESTS_PER_THREAD {
                    relay.increment_counter(
                        "stress.requests",
                        unit::REQUEST,
                        labels([("worker", worker.to_string())]),
                    );
                    relay.request_flush();
                }
            });
        }
    });
    let elapsed = start.elapsed();

    let health = relay.health();
    let total = THREADS * REQUESTS_PER_THREAD;
    let expected_dropped = (total - BUFFER_SIZE - POOL_SIZE) as u64;
    println!("after:  {:?}", health);
    println!(
        "{} requests in {:?}, dropped {} (expected {})",
        total.to_formatted_string(&Locale::en),
        elapsed,
        health.dropped_requests.to_formatted_string(&Locale::en),
        expected_dropped.to_formatted_string(&Locale::en),
    );
    assert_eq!(health.dropped_requests, expected_dropped);

    client.release_flushes();
    relay.close().expect("relay closes");
    println!(
        "flushes completed: {}, client closed {} time(s)",
        client.flush_count(),
        client.close_count()
    );
}
