//! Metric primitives handed out by the registry.
//!
//! Every primitive keeps its authoritative value locally, under its own lock,
//! and forwards each mutation to the backend handle it was created with. The
//! forward is a best-effort side channel: it happens after the local update
//! and is not ordered with respect to [`Counter::get`] or [`Gauge::get`].
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::exporter::{CounterHandle, GaugeHandle, HistogramHandle};
use crate::key::Labels;

/// Units commonly used with the relay's instruments.
pub mod unit {
    /// Ratio expressed in percent.
    pub const PERCENT: &str = "%";
    /// Seconds.
    pub const SECONDS: &str = "s";
    /// Milliseconds.
    pub const MILLISECONDS: &str = "ms";
    /// Bytes.
    pub const BYTES: &str = "By";
    /// Request count.
    pub const REQUEST: &str = "{request}";
}

/// Well-known instrument names.
pub mod names {
    /// Total number of HTTP requests served.
    pub const HTTP_SERVER_REQUESTS_TOTAL: &str = "http.server.requests.total";
    /// Duration of HTTP requests served.
    pub const HTTP_SERVER_REQUEST_DURATION: &str = "http.server.request.duration";
}

/// The kind of a metric primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    /// Monotonic integer accumulator.
    Counter,
    /// Settable floating point value.
    Gauge,
    /// Distribution of floating point observations.
    Histogram,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::Histogram => "histogram",
        })
    }
}

// Values behind these locks are plain numbers and stay valid even if a
// holder panicked, so a poisoned lock is recovered instead of propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A monotonic integer counter.
pub struct Counter {
    name: String,
    unit: String,
    labels: Labels,
    value: Mutex<u64>,
    handle: Option<Box<dyn CounterHandle>>,
}

impl Counter {
    pub(crate) fn new(
        name: &str,
        unit: &str,
        labels: Labels,
        handle: Option<Box<dyn CounterHandle>>,
    ) -> Self {
        Counter {
            name: name.to_owned(),
            unit: unit.to_owned(),
            labels,
            value: Mutex::new(0),
            handle,
        }
    }

    /// Creates a counter that only tracks its value locally.
    pub fn detached(name: impl Into<String>, unit: impl Into<String>, labels: Labels) -> Self {
        Counter {
            name: name.into(),
            unit: unit.into(),
            labels,
            value: Mutex::new(0),
            handle: None,
        }
    }

    /// Increments the counter by one and returns the new value.
    pub fn inc(&self) -> u64 {
        self.add(1)
    }

    /// Adds `delta` and returns the value right after this addition.
    ///
    /// The delta, not the total, is forwarded to the backend.
    pub fn add(&self, delta: u64) -> u64 {
        let value = {
            let mut value = lock(&self.value);
            *value = value.saturating_add(delta);
            *value
        };
        if let Some(handle) = &self.handle {
            handle.add(delta, &self.labels);
        }
        value
    }

    /// Current local value.
    pub fn get(&self) -> u64 {
        *lock(&self.value)
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Labels attached to every forwarded delta.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Returns `true` if the counter has no backend handle.
    pub fn is_detached(&self) -> bool {
        self.handle.is_none()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("labels", &self.labels)
            .field("value", &self.get())
            .finish()
    }
}

/// A floating point value that can go up and down.
pub struct Gauge {
    name: String,
    unit: String,
    labels: Labels,
    value: Mutex<f64>,
    handle: Option<Box<dyn GaugeHandle>>,
}

impl Gauge {
    pub(crate) fn new(
        name: &str,
        unit: &str,
        labels: Labels,
        handle: Option<Box<dyn GaugeHandle>>,
    ) -> Self {
        Gauge {
            name: name.to_owned(),
            unit: unit.to_owned(),
            labels,
            value: Mutex::new(0.0),
            handle,
        }
    }

    /// Creates a gauge that only tracks its value locally.
    pub fn detached(name: impl Into<String>, unit: impl Into<String>, labels: Labels) -> Self {
        Gauge {
            name: name.into(),
            unit: unit.into(),
            labels,
            value: Mutex::new(0.0),
            handle: None,
        }
    }

    /// Sets the gauge to `value`.
    pub fn set(&self, value: f64) {
        *lock(&self.value) = value;
        self.forward(value);
    }

    /// Adds one and returns the new value.
    pub fn inc(&self) -> f64 {
        self.add(1.0)
    }

    /// Subtracts one and returns the new value.
    pub fn dec(&self) -> f64 {
        self.add(-1.0)
    }

    /// Adds `delta` and returns the value right after this addition.
    ///
    /// Gauges are not deltas: the resulting absolute value is forwarded.
    pub fn add(&self, delta: f64) -> f64 {
        let value = {
            let mut value = lock(&self.value);
            *value += delta;
            *value
        };
        self.forward(value);
        value
    }

    /// Current local value.
    pub fn get(&self) -> f64 {
        *lock(&self.value)
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Labels attached to every forwarded value.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Returns `true` if the gauge has no backend handle.
    pub fn is_detached(&self) -> bool {
        self.handle.is_none()
    }

    fn forward(&self, value: f64) {
        if let Some(handle) = &self.handle {
            handle.set(value, &self.labels);
        }
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gauge")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("labels", &self.labels)
            .field("value", &self.get())
            .finish()
    }
}

/// A distribution of observations.
///
/// Histograms keep no local value; every observation goes straight to the
/// backend handle, which is called under the histogram's lock.
pub struct Histogram {
    name: String,
    unit: String,
    labels: Labels,
    buckets: Vec<f64>,
    handle: Mutex<Option<Box<dyn HistogramHandle>>>,
}

impl Histogram {
    pub(crate) fn new(
        name: &str,
        unit: &str,
        buckets: &[f64],
        labels: Labels,
        handle: Option<Box<dyn HistogramHandle>>,
    ) -> Self {
        Histogram {
            name: name.to_owned(),
            unit: unit.to_owned(),
            labels,
            buckets: buckets.to_vec(),
            handle: Mutex::new(handle),
        }
    }

    /// Creates a histogram without a backend handle. Observations are discarded.
    pub fn detached(
        name: impl Into<String>,
        unit: impl Into<String>,
        buckets: &[f64],
        labels: Labels,
    ) -> Self {
        Histogram {
            name: name.into(),
            unit: unit.into(),
            labels,
            buckets: buckets.to_vec(),
            handle: Mutex::new(None),
        }
    }

    /// Records one observation.
    pub fn record(&self, value: f64) {
        if let Some(handle) = lock(&self.handle).as_mut() {
            handle.record(value, &self.labels);
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Labels attached to every observation.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Bucket boundaries the histogram was created with.
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    /// Returns `true` if the histogram has no backend handle.
    pub fn is_detached(&self) -> bool {
        lock(&self.handle).is_none()
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("labels", &self.labels)
            .field("buckets", &self.buckets)
            .finish()
    }
}
