//! In-memory exporter client for tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ExporterError, ExporterResult};
use crate::exporter::{CounterHandle, ExporterClient, GaugeHandle, HistogramHandle};
use crate::instrument::InstrumentKind;
use crate::key::Labels;

/// An [`ExporterClient`] that keeps everything it receives in memory.
///
/// Clones share state, so a test can hand one clone to the relay and inspect
/// the other. Flushes can be blocked to simulate a stalled backend, and
/// creations or flushes can be made to fail.
///
/// # Example
///
/// ```
/// # #[cfg(feature = "testing")]
/// # {
/// use opentelemetry_relay::testing::InMemoryExporterClient;
/// use opentelemetry_relay::ExporterClient;
///
/// let client = InMemoryExporterClient::default();
/// client.flush().unwrap();
/// assert_eq!(client.flush_count(), 1);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryExporterClient {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    created: Mutex<Vec<(InstrumentKind, String)>>,
    counter_deltas: Mutex<HashMap<String, Vec<u64>>>,
    gauge_values: Mutex<HashMap<String, Vec<f64>>>,
    histogram_records: Mutex<HashMap<String, Vec<f64>>>,
    creation_delay: Mutex<Duration>,
    flushes_started: AtomicUsize,
    flushes_completed: AtomicUsize,
    close_count: AtomicUsize,
    fail_creation: AtomicBool,
    panic_on_creation: AtomicBool,
    fail_flush: AtomicBool,
    closed: AtomicBool,
    gate: Gate,
}

#[derive(Debug, Default)]
struct Gate {
    blocked: Mutex<bool>,
    // When set, only flushes on threads whose name starts with it are blocked.
    thread_prefix: Mutex<Option<String>>,
    released: Condvar,
}

impl Gate {
    fn applies_to_current_thread(&self) -> bool {
        match &*lock(&self.thread_prefix) {
            Some(prefix) => thread::current()
                .name()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
            None => true,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryExporterClient {
    /// Makes every following `create_*` call fail.
    pub fn fail_creations(&self, fail: bool) {
        self.inner.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Makes every following `flush` call fail.
    pub fn fail_flushes(&self, fail: bool) {
        self.inner.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Makes every following `create_*` call panic.
    pub fn panic_on_creations(&self, panic: bool) {
        self.inner.panic_on_creation.store(panic, Ordering::SeqCst);
    }

    /// Sleeps for `delay` inside every `create_*` call, widening race windows.
    pub fn set_creation_delay(&self, delay: Duration) {
        *lock(&self.inner.creation_delay) = delay;
    }

    /// Makes every following `flush` call wait until [`release_flushes`] is called.
    ///
    /// [`release_flushes`]: InMemoryExporterClient::release_flushes
    pub fn block_flushes(&self) {
        *lock(&self.inner.gate.thread_prefix) = None;
        *lock(&self.inner.gate.blocked) = true;
    }

    /// Like [`block_flushes`], but only for flushes running on threads whose
    /// name starts with `prefix`. Other flushes complete immediately.
    ///
    /// [`block_flushes`]: InMemoryExporterClient::block_flushes
    pub fn block_flushes_on_threads(&self, prefix: &str) {
        *lock(&self.inner.gate.thread_prefix) = Some(prefix.to_owned());
        *lock(&self.inner.gate.blocked) = true;
    }

    /// Lets blocked and future flushes proceed.
    pub fn release_flushes(&self) {
        *lock(&self.inner.gate.thread_prefix) = None;
        *lock(&self.inner.gate.blocked) = false;
        self.inner.gate.released.notify_all();
    }

    /// Number of instruments created, per kind.
    pub fn creation_count(&self, kind: InstrumentKind) -> usize {
        lock(&self.inner.created)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Number of instruments created with `name`, any kind.
    pub fn creations_of(&self, name: &str) -> usize {
        lock(&self.inner.created)
            .iter()
            .filter(|(_, n)| n == name)
            .count()
    }

    /// Deltas forwarded to the counter called `name`, in arrival order.
    pub fn counter_deltas(&self, name: &str) -> Vec<u64> {
        lock(&self.inner.counter_deltas)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Values forwarded to the gauge called `name`, in arrival order.
    pub fn gauge_values(&self, name: &str) -> Vec<f64> {
        lock(&self.inner.gauge_values)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Observations forwarded to the histogram called `name`, in arrival order.
    pub fn histogram_records(&self, name: &str) -> Vec<f64> {
        lock(&self.inner.histogram_records)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `flush` calls that entered the client, blocked or not.
    pub fn flushes_started(&self) -> usize {
        self.inner.flushes_started.load(Ordering::SeqCst)
    }

    /// Number of `flush` calls that returned.
    pub fn flush_count(&self) -> usize {
        self.inner.flushes_completed.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` flushes have started or `timeout` elapses.
    /// Returns whether the count was reached.
    pub fn wait_for_flushes_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.flushes_started() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn create(&self, kind: InstrumentKind, name: &str) -> ExporterResult {
        let delay = *lock(&self.inner.creation_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ExporterError::AlreadyShutdown);
        }
        if name.is_empty() {
            return Err(ExporterError::InvalidInstrument(
                "instrument name must be non-empty".into(),
            ));
        }
        if self.inner.panic_on_creation.load(Ordering::SeqCst) {
            panic!("exporter client panicked while creating {kind} {name}");
        }
        if self.inner.fail_creation.load(Ordering::SeqCst) {
            return Err(ExporterError::InternalFailure(format!(
                "refusing to create {kind} {name}"
            )));
        }
        lock(&self.inner.created).push((kind, name.to_owned()));
        Ok(())
    }
}

impl ExporterClient for InMemoryExporterClient {
    fn create_counter(&self, name: &str, _unit: &str) -> ExporterResult<Box<dyn CounterHandle>> {
        self.create(InstrumentKind::Counter, name)?;
        Ok(Box::new(InMemoryHandle {
            inner: self.inner.clone(),
            name: name.to_owned(),
        }))
    }

    fn create_gauge(&self, name: &str, _unit: &str) -> ExporterResult<Box<dyn GaugeHandle>> {
        self.create(InstrumentKind::Gauge, name)?;
        Ok(Box::new(InMemoryHandle {
            inner: self.inner.clone(),
            name: name.to_owned(),
        }))
    }

    fn create_histogram(
        &self,
        name: &str,
        _unit: &str,
        _buckets: &[f64],
    ) -> ExporterResult<Box<dyn HistogramHandle>> {
        self.create(InstrumentKind::Histogram, name)?;
        Ok(Box::new(InMemoryHandle {
            inner: self.inner.clone(),
            name: name.to_owned(),
        }))
    }

    fn flush(&self) -> ExporterResult {
        self.inner.flushes_started.fetch_add(1, Ordering::SeqCst);
        if self.inner.gate.applies_to_current_thread() {
            let mut blocked = lock(&self.inner.gate.blocked);
            while *blocked {
                blocked = self
                    .inner
                    .gate
                    .released
                    .wait(blocked)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.inner.flushes_completed.fetch_add(1, Ordering::SeqCst);

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ExporterError::AlreadyShutdown);
        }
        if self.inner.fail_flush.load(Ordering::SeqCst) {
            return Err(ExporterError::ExportFailed("backend unavailable".into()));
        }
        Ok(())
    }

    fn close(&self) -> ExporterResult {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ExporterError::AlreadyShutdown);
        }
        Ok(())
    }
}

struct InMemoryHandle {
    inner: Arc<Inner>,
    name: String,
}

impl CounterHandle for InMemoryHandle {
    fn add(&self, delta: u64, _labels: &Labels) {
        lock(&self.inner.counter_deltas)
            .entry(self.name.clone())
            .or_default()
            .push(delta);
    }
}

impl GaugeHandle for InMemoryHandle {
    fn set(&self, value: f64, _labels: &Labels) {
        lock(&self.inner.gauge_values)
            .entry(self.name.clone())
            .or_default()
            .push(value);
    }
}

impl HistogramHandle for InMemoryHandle {
    fn record(&mut self, value: f64, _labels: &Labels) {
        lock(&self.inner.histogram_records)
            .entry(self.name.clone())
            .or_default()
            .push(value);
    }
}
