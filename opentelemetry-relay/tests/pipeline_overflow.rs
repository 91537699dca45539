//! Overflow behaviour of the delivery pipeline against a stalled backend.
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use opentelemetry_relay::testing::InMemoryExporterClient;
use opentelemetry_relay::{labels, unit, MetricsRelay, RelayConfig};

const WAIT: Duration = Duration::from_secs(5);

fn stalled_relay(buffer_size: usize, pool_size: usize) -> (MetricsRelay, InMemoryExporterClient) {
    let config = RelayConfig::builder()
        .with_service_name("overflow-test")
        .with_buffer_size(buffer_size)
        .with_pool_size(pool_size)
        .with_send_interval(Duration::from_secs(3600))
        .with_min_send_interval(Duration::ZERO)
        .with_shutdown_timeout(WAIT)
        .build()
        .unwrap();
    let client = InMemoryExporterClient::default();
    let relay = MetricsRelay::new(config, Arc::new(client.clone())).unwrap();

    client.block_flushes();
    relay.request_flush();
    assert!(client.wait_for_flushes_started(1, WAIT));
    (relay, client)
}

#[test]
fn saturated_pipeline_counts_every_refused_request() {
    let buffer_size = 5;
    let pool_size = 10;
    let (relay, client) = stalled_relay(buffer_size, pool_size);

    let threads = 20;
    let requests_per_thread = 10;
    let barrier = Barrier::new(threads);
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..requests_per_thread {
                    relay.request_flush();
                }
            });
        }
    });

    let health = relay.health();
    assert_eq!(
        health.dropped_requests,
        (threads * requests_per_thread - buffer_size - pool_size) as u64
    );
    assert_eq!(health.pool_running, pool_size);
    assert_eq!(health.pool_free, 0);
    assert_eq!(health.pool_capacity, pool_size);

    client.release_flushes();
    relay.close().unwrap();
    assert_eq!(relay.health().dropped_requests, health.dropped_requests);
}

#[test]
fn request_flush_returns_immediately_when_saturated() {
    let (relay, client) = stalled_relay(1, 1);
    // Fill the queue and the pool.
    relay.request_flush();
    relay.request_flush();

    let start = Instant::now();
    for _ in 0..10_000 {
        relay.request_flush();
    }
    assert!(start.elapsed() < WAIT);
    assert_eq!(relay.health().dropped_requests, 10_000);

    client.release_flushes();
    relay.close().unwrap();
}

#[test]
fn metric_updates_keep_working_while_backend_is_stalled() {
    let (relay, client) = stalled_relay(2, 2);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..250 {
                    relay.increment_counter(
                        "jobs.done",
                        unit::REQUEST,
                        labels([("queue", "default")]),
                    );
                    relay.request_flush();
                }
            });
        }
    });

    let counter = relay
        .counter("jobs.done", unit::REQUEST, labels([("queue", "default")]))
        .unwrap();
    assert_eq!(counter.get(), 1_000);
    assert!(relay.health().dropped_requests > 0);

    client.release_flushes();
    relay.close().unwrap();
    assert_eq!(client.counter_deltas("jobs.done").len(), 1_000);
}
