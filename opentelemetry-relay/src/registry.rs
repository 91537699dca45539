//! Instrument registry.
//!
//! The registry guarantees that each `(kind, name, labels)` maps to exactly
//! one live primitive, and that the exporter client is asked to build the
//! backing instrument exactly once for it, no matter how many threads race
//! on the first access.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ExporterError, ExporterResult, MetricError, MetricResult};
use crate::exporter::ExporterClient;
use crate::instrument::{Counter, Gauge, Histogram, InstrumentKind};
use crate::key::{Labels, MetricKey};
use crate::relay_warn;

/// Maximum number of bucket boundaries accepted for a histogram.
pub const MAX_HISTOGRAM_BUCKETS: usize = 20;

#[derive(Default)]
struct Instruments {
    counters: HashMap<MetricKey, Arc<Counter>>,
    gauges: HashMap<MetricKey, Arc<Gauge>>,
    histograms: HashMap<MetricKey, Arc<Histogram>>,
    is_shutdown: bool,
}

impl Instruments {
    fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.histograms.len()
    }
}

/// Caches metric primitives by [`MetricKey`] and delegates instrument
/// construction to an [`ExporterClient`].
///
/// Entries are never replaced or removed while the registry is open.
pub struct InstrumentRegistry {
    client: Arc<dyn ExporterClient>,
    state: RwLock<Instruments>,
}

impl fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("client", &self.client)
            .field("len", &self.len())
            .finish()
    }
}

impl InstrumentRegistry {
    /// Creates an empty registry backed by `client`.
    pub fn new(client: Arc<dyn ExporterClient>) -> Self {
        InstrumentRegistry {
            client,
            state: RwLock::new(Instruments::default()),
        }
    }

    /// Returns the counter for `name` and `labels`, creating it on first use.
    pub fn get_or_create_counter(
        &self,
        name: &str,
        unit: &str,
        labels: Labels,
    ) -> MetricResult<Arc<Counter>> {
        self.get_or_create(
            InstrumentKind::Counter,
            name,
            labels,
            |state| &state.counters,
            |state| &mut state.counters,
            |labels| {
                let handle = self.client.create_counter(name, unit)?;
                Ok(Counter::new(name, unit, labels, Some(handle)))
            },
        )
    }

    /// Returns the gauge for `name` and `labels`, creating it on first use.
    pub fn get_or_create_gauge(
        &self,
        name: &str,
        unit: &str,
        labels: Labels,
    ) -> MetricResult<Arc<Gauge>> {
        self.get_or_create(
            InstrumentKind::Gauge,
            name,
            labels,
            |state| &state.gauges,
            |state| &mut state.gauges,
            |labels| {
                let handle = self.client.create_gauge(name, unit)?;
                Ok(Gauge::new(name, unit, labels, Some(handle)))
            },
        )
    }

    /// Returns the histogram for `name` and `labels`, creating it on first use.
    ///
    /// More than [`MAX_HISTOGRAM_BUCKETS`] boundaries fail with
    /// [`MetricError::TooManyBuckets`] before the cache or the exporter client
    /// is consulted. The boundaries of an already cached histogram win over
    /// the ones passed to later calls.
    pub fn get_or_create_histogram(
        &self,
        name: &str,
        unit: &str,
        buckets: &[f64],
        labels: Labels,
    ) -> MetricResult<Arc<Histogram>> {
        if buckets.len() > MAX_HISTOGRAM_BUCKETS {
            return Err(MetricError::TooManyBuckets {
                count: buckets.len(),
                max: MAX_HISTOGRAM_BUCKETS,
            });
        }

        self.get_or_create(
            InstrumentKind::Histogram,
            name,
            labels,
            |state| &state.histograms,
            |state| &mut state.histograms,
            |labels| {
                let handle = self.client.create_histogram(name, unit, buckets)?;
                Ok(Histogram::new(name, unit, buckets, labels, Some(handle)))
            },
        )
    }

    // Double-checked lookup: a shared lock serves the common cache hit, the
    // exclusive lock re-checks before creating because another thread may
    // have inserted the key between the two acquisitions.
    fn get_or_create<T, Get, GetMut, Create>(
        &self,
        kind: InstrumentKind,
        name: &str,
        labels: Labels,
        map: Get,
        map_mut: GetMut,
        create: Create,
    ) -> MetricResult<Arc<T>>
    where
        Get: Fn(&Instruments) -> &HashMap<MetricKey, Arc<T>>,
        GetMut: Fn(&mut Instruments) -> &mut HashMap<MetricKey, Arc<T>>,
        Create: FnOnce(Labels) -> ExporterResult<T>,
    {
        let key = MetricKey::new(name, &labels);

        {
            let state = self.read();
            if state.is_shutdown {
                return Err(MetricError::AlreadyShutdown);
            }
            if let Some(existing) = map(&*state).get(&key) {
                return Ok(Arc::clone(existing));
            }
        }

        let mut state = self.write();
        if state.is_shutdown {
            return Err(MetricError::AlreadyShutdown);
        }
        if let Some(existing) = map(&*state).get(&key) {
            return Ok(Arc::clone(existing));
        }

        // A panicking client must not poison the lock for every other key.
        let created = panic::catch_unwind(AssertUnwindSafe(|| create(labels)))
            .unwrap_or_else(|_| {
                Err(ExporterError::InternalFailure(
                    "instrument creation panicked".to_owned(),
                ))
            });
        let instrument = created.map_err(|source| {
            relay_warn!(
                name: "InstrumentRegistry.CreationFailed",
                kind = format!("{kind}"),
                key = format!("{key}"),
                error = format!("{source}")
            );
            MetricError::CreationFailed {
                kind,
                name: name.to_owned(),
                source,
            }
        })?;
        let instrument = Arc::new(instrument);
        insert_new(map_mut(&mut *state), key, Arc::clone(&instrument));
        Ok(instrument)
    }

    // The only mutations are whole-entry inserts and the reset in `close`, so
    // the state behind a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Instruments> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Instruments> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached primitives across all kinds.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no primitive is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached primitives of `kind`.
    pub fn count(&self, kind: InstrumentKind) -> usize {
        let state = self.read();
        match kind {
            InstrumentKind::Counter => state.counters.len(),
            InstrumentKind::Gauge => state.gauges.len(),
            InstrumentKind::Histogram => state.histograms.len(),
        }
    }

    /// Returns `true` once [`close`](InstrumentRegistry::close) succeeded.
    pub fn is_closed(&self) -> bool {
        self.read().is_shutdown
    }

    /// Closes the exporter client and drops every cached primitive.
    ///
    /// Primitives still held by callers keep working on their local values.
    /// Calling `close` again returns [`MetricError::AlreadyShutdown`]; so do
    /// later `get_or_create_*` calls.
    pub fn close(&self) -> MetricResult<()> {
        let mut state = self.write();
        if state.is_shutdown {
            return Err(MetricError::AlreadyShutdown);
        }
        self.client.close()?;
        *state = Instruments {
            is_shutdown: true,
            ..Instruments::default()
        };
        Ok(())
    }

    /// Refuses further lookups and drops every cached primitive without
    /// closing the exporter client.
    ///
    /// Used when background flushes may still be running against the client.
    /// Returns [`MetricError::AlreadyShutdown`] if the registry is closed.
    pub(crate) fn close_without_client(&self) -> MetricResult<()> {
        let mut state = self.write();
        if state.is_shutdown {
            return Err(MetricError::AlreadyShutdown);
        }
        *state = Instruments {
            is_shutdown: true,
            ..Instruments::default()
        };
        Ok(())
    }
}

fn insert_new<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, value: V) {
    let previous = map.insert(key, value);
    debug_assert!(previous.is_none(), "registry entries are never replaced");
}

#[cfg(test)]
mod tests {
    use super::{InstrumentRegistry, MAX_HISTOGRAM_BUCKETS};
    use crate::error::{ExporterError, MetricError};
    use crate::instrument::{unit, InstrumentKind};
    use crate::key::{labels, Labels};
    use crate::testing::InMemoryExporterClient;
    use rstest::rstest;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn registry() -> (InstrumentRegistry, InMemoryExporterClient) {
        let client = InMemoryExporterClient::default();
        (InstrumentRegistry::new(Arc::new(client.clone())), client)
    }

    #[test]
    fn cached_counter_is_returned_on_second_lookup() {
        let (registry, client) = registry();
        let first = registry
            .get_or_create_counter("requests", unit::REQUEST, labels([("method", "GET")]))
            .unwrap();
        let second = registry
            .get_or_create_counter("requests", unit::REQUEST, labels([("method", "GET")]))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.creation_count(InstrumentKind::Counter), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn label_order_does_not_create_new_instruments() {
        let (registry, client) = registry();
        let a = registry
            .get_or_create_gauge("memory", unit::BYTES, labels([("a", "1"), ("b", "2")]))
            .unwrap();
        let b = registry
            .get_or_create_gauge("memory", unit::BYTES, labels([("b", "2"), ("a", "1")]))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.creation_count(InstrumentKind::Gauge), 1);
    }

    #[test]
    fn kinds_are_cached_independently() {
        let (registry, client) = registry();
        registry
            .get_or_create_counter("shared", "", Labels::new())
            .unwrap();
        registry
            .get_or_create_gauge("shared", "", Labels::new())
            .unwrap();
        registry
            .get_or_create_histogram("shared", "", &[], Labels::new())
            .unwrap();

        assert_eq!(client.creations_of("shared"), 3);
        assert_eq!(registry.count(InstrumentKind::Counter), 1);
        assert_eq!(registry.count(InstrumentKind::Gauge), 1);
        assert_eq!(registry.count(InstrumentKind::Histogram), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn distinct_labels_create_distinct_primitives() {
        let (registry, _client) = registry();
        let get = registry
            .get_or_create_counter("requests", "", labels([("method", "GET")]))
            .unwrap();
        let post = registry
            .get_or_create_counter("requests", "", labels([("method", "POST")]))
            .unwrap();

        get.inc();
        assert_eq!(get.get(), 1);
        assert_eq!(post.get(), 0);
        assert!(!Arc::ptr_eq(&get, &post));
    }

    #[test]
    fn concurrent_first_access_creates_one_instrument() {
        let (registry, client) = registry();
        // Keep the creator inside the write lock long enough for every other
        // thread to pile up behind it.
        client.set_creation_delay(Duration::from_millis(20));
        let threads = 16;
        let barrier = Barrier::new(threads);

        let counters: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry
                            .get_or_create_counter(
                                "racy",
                                "",
                                labels([("shard", "0"), ("zone", "a")]),
                            )
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(client.creation_count(InstrumentKind::Counter), 1);
        assert!(counters.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn concurrent_adds_through_registry_sum_up() {
        let (registry, client) = registry();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        registry
                            .get_or_create_counter("hits", "", Labels::new())
                            .unwrap()
                            .add(2);
                    }
                });
            }
        });

        let counter = registry
            .get_or_create_counter("hits", "", Labels::new())
            .unwrap();
        assert_eq!(counter.get(), 8 * 500 * 2);
        assert_eq!(client.counter_deltas("hits").iter().sum::<u64>(), 8_000);
    }

    #[test]
    fn empty_name_fails_on_creation_and_caches_nothing() {
        let (registry, client) = registry();
        let err = registry
            .get_or_create_counter("", "", Labels::new())
            .unwrap_err();

        assert!(matches!(
            err,
            MetricError::CreationFailed {
                kind: InstrumentKind::Counter,
                source: ExporterError::InvalidInstrument(_),
                ..
            }
        ));
        assert!(registry.is_empty());
        assert_eq!(client.creation_count(InstrumentKind::Counter), 0);
    }

    #[test]
    fn failed_creation_can_be_retried() {
        let (registry, client) = registry();
        client.fail_creations(true);
        assert!(registry
            .get_or_create_gauge("queue.depth", "", Labels::new())
            .is_err());

        client.fail_creations(false);
        let gauge = registry
            .get_or_create_gauge("queue.depth", "", Labels::new())
            .unwrap();
        gauge.set(3.0);
        assert_eq!(gauge.get(), 3.0);
        assert_eq!(client.creation_count(InstrumentKind::Gauge), 1);
    }

    #[test]
    fn cached_entries_are_not_revalidated() {
        let (registry, client) = registry();
        let first = registry
            .get_or_create_counter("stable", "", Labels::new())
            .unwrap();
        client.fail_creations(true);
        let second = registry
            .get_or_create_counter("stable", "", Labels::new())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[rstest]
    #[case(0, true)]
    #[case(MAX_HISTOGRAM_BUCKETS, true)]
    #[case(MAX_HISTOGRAM_BUCKETS + 1, false)]
    #[case(64, false)]
    fn histogram_bucket_limit(#[case] bucket_count: usize, #[case] accepted: bool) {
        let (registry, client) = registry();
        let buckets: Vec<f64> = (1..=bucket_count).map(|b| b as f64).collect();

        let result =
            registry.get_or_create_histogram("latency", unit::SECONDS, &buckets, Labels::new());

        if accepted {
            assert_eq!(result.unwrap().buckets().len(), bucket_count);
            assert_eq!(client.creation_count(InstrumentKind::Histogram), 1);
        } else {
            assert!(matches!(
                result.unwrap_err(),
                MetricError::TooManyBuckets { count, max }
                    if count == bucket_count && max == MAX_HISTOGRAM_BUCKETS
            ));
            assert_eq!(client.creation_count(InstrumentKind::Histogram), 0);
        }
    }

    #[test]
    fn panicking_client_does_not_poison_the_registry() {
        let (registry, client) = registry();
        registry
            .get_or_create_gauge("memory", unit::BYTES, Labels::new())
            .unwrap();

        client.panic_on_creations(true);
        assert!(matches!(
            registry.get_or_create_counter("requests", "", Labels::new()),
            Err(MetricError::CreationFailed {
                kind: InstrumentKind::Counter,
                source: ExporterError::InternalFailure(_),
                ..
            })
        ));
        client.panic_on_creations(false);

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_closed());
        registry
            .get_or_create_counter("requests", "", Labels::new())
            .unwrap();
        assert_eq!(registry.count(InstrumentKind::Counter), 1);
    }

    #[test]
    fn close_closes_client_and_clears_cache() {
        let (registry, client) = registry();
        let counter = registry
            .get_or_create_counter("requests", "", Labels::new())
            .unwrap();

        registry.close().unwrap();

        assert_eq!(client.close_count(), 1);
        assert!(registry.is_closed());
        assert!(registry.is_empty());
        // Primitives already handed out keep their local state.
        assert_eq!(counter.inc(), 1);
    }

    #[test]
    fn close_twice_returns_already_shutdown() {
        let (registry, client) = registry();
        registry.close().unwrap();

        assert!(matches!(registry.close(), Err(MetricError::AlreadyShutdown)));
        assert!(matches!(registry.close(), Err(MetricError::AlreadyShutdown)));
        assert_eq!(client.close_count(), 1);
    }

    #[test]
    fn lookups_after_close_are_refused() {
        let (registry, client) = registry();
        registry.close().unwrap();

        assert!(matches!(
            registry.get_or_create_counter("late", "", Labels::new()),
            Err(MetricError::AlreadyShutdown)
        ));
        assert_eq!(client.creation_count(InstrumentKind::Counter), 0);
    }
}
