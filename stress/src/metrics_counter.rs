/*
    Measures the hot path of a cached counter: registry lookup by name and
    labels, local update, and the forward to an OpenTelemetry SDK counter.
    The provider uses a manual reader, so nothing is ever exported.

    Run with `cargo run --release --bin metrics_counter`, stop with Ctrl-C.
*/

use lazy_static::lazy_static;
use opentelemetry_relay::{labels, unit, InstrumentRegistry, OtelExporterClient};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use rand::{
    rngs::{self},
    Rng, SeedableRng,
};
use std::cell::RefCell;
use std::sync::Arc;

mod throughput;

lazy_static! {
    static ref REGISTRY: InstrumentRegistry = {
        let provider = SdkMeterProvider::builder()
            .with_reader(ManualReader::builder().build())
            .build();
        InstrumentRegistry::new(Arc::new(OtelExporterClient::with_meter_provider(provider)))
    };
    static ref ATTRIBUTE_VALUES: [&'static str; 10] = [
        "value1", "value2", "value3", "value4", "value5", "value6", "value7", "value8", "value9",
        "value10"
    ];
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

fn main() {
    throughput::test_throughput(test_counter);
}

fn test_counter() {
    let len = ATTRIBUTE_VALUES.len();
    let (first, second, third) = CURRENT_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        (
            rng.random_range(0..len),
            rng.random_range(0..len),
            rng.random_range(0..len),
        )
    });

    // Each attribute has 10 possible values, so there are 1000 possible
    // combinations (time-series), each created once and then served from cache.
    let counter = REGISTRY
        .get_or_create_counter(
            "stress.requests",
            unit::REQUEST,
            labels([
                ("attribute1", ATTRIBUTE_VALUES[first]),
                ("attribute2", ATTRIBUTE_VALUES[second]),
                ("attribute3", ATTRIBUTE_VALUES[third]),
            ]),
        )
        .expect("counter creation must succeed");
    counter.inc();
}
