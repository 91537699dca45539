//! Asynchronous delivery pipeline.
//!
//! Flush requests are signals, not data: the accumulated state lives in the
//! primitives and in the exporter client, so a request only has to make sure
//! that *some* flush happens soon. A request is first offered to a bounded
//! signal queue drained by a background worker, then to the overflow
//! [`WorkerPool`]. A request neither of them accepts is counted in
//! `dropped_requests` and the caller moves on; [`DeliveryPipeline::request_flush`]
//! never blocks.
//!
//! The worker also flushes every `send_interval` without any signal, and once
//! more on shutdown. Every flush, whatever triggered it, goes through a
//! [`RateLimiter`] so that triggers that coincide produce a single export.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::error::{ExporterError, ExporterResult, MetricError, MetricResult};
use crate::exporter::ExporterClient;
use crate::pool::{PoolError, WorkerPool};
use crate::{relay_debug, relay_error, relay_info, relay_warn};

/// Enforces a minimum delay between two flushes.
///
/// The first call to [`try_acquire`](RateLimiter::try_acquire) is always
/// granted. A zero interval grants every call.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_flush: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter that grants at most one flush per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        RateLimiter {
            min_interval,
            last_flush: Mutex::new(None),
        }
    }

    /// Returns `true` and records the current time if a flush may proceed now.
    pub fn try_acquire(&self) -> bool {
        let mut last_flush = self
            .last_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(last) = *last_flush {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        *last_flush = Some(now);
        true
    }

    /// The configured minimum delay.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Point-in-time view of the pipeline's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Flush requests refused by both the signal queue and the overflow pool.
    pub dropped_requests: u64,
    /// Overflow jobs accepted and not finished yet.
    pub pool_running: usize,
    /// Overflow jobs that can still be accepted.
    pub pool_free: usize,
    /// Maximum number of overflow jobs in flight.
    pub pool_capacity: usize,
}

struct PipelineInner {
    client: Arc<dyn ExporterClient>,
    rate_limiter: RateLimiter,
    dropped_requests: AtomicU64,
    is_shutdown: AtomicBool,
}

impl PipelineInner {
    // `None` means the rate limiter skipped the flush.
    fn try_flush(&self) -> Option<ExporterResult> {
        if !self.rate_limiter.try_acquire() {
            relay_debug!(
                name: "DeliveryPipeline.FlushRateLimited",
                min_send_interval = format!("{:?}", self.rate_limiter.min_interval())
            );
            return None;
        }
        Some(self.client.flush())
    }

    fn flush_in_background(&self, trigger: &'static str) {
        relay_debug!(name: "DeliveryPipeline.Flushing", trigger = trigger);
        if let Some(Err(err)) = self.try_flush() {
            relay_warn!(
                name: "DeliveryPipeline.FlushFailed",
                trigger = trigger,
                error = format!("{err}")
            );
        }
    }
}

struct Worker {
    handle: thread::JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

/// Decouples flush requests from the exporter client.
///
/// Owns one background worker thread and a [`WorkerPool`]. Dropping the
/// pipeline shuts it down if [`shutdown`](DeliveryPipeline::shutdown) was not
/// called.
pub struct DeliveryPipeline {
    inner: Arc<PipelineInner>,
    signal_sender: mpsc::SyncSender<()>,
    pool: WorkerPool,
    worker: Mutex<Option<Worker>>,
    shutdown_timeout: Duration,
}

impl fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("stats", &self.stats())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

impl DeliveryPipeline {
    /// Starts the background worker and the overflow pool.
    ///
    /// Uses `buffer_size`, `send_interval`, `min_send_interval`, `pool_size`
    /// and `shutdown_timeout` from `config`.
    pub fn new(client: Arc<dyn ExporterClient>, config: &RelayConfig) -> MetricResult<Self> {
        let inner = Arc::new(PipelineInner {
            client,
            rate_limiter: RateLimiter::new(config.min_send_interval),
            dropped_requests: AtomicU64::new(0),
            is_shutdown: AtomicBool::new(false),
        });
        let (signal_sender, signal_receiver) = mpsc::sync_channel::<()>(config.buffer_size);
        let (done_sender, done_receiver) = mpsc::sync_channel::<()>(1);
        let send_interval = config.send_interval;

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("OpenTelemetry.Relay.Worker".to_string())
            .spawn(move || {
                Self::run_worker(&worker_inner, signal_receiver, send_interval);
                let _ = done_sender.send(());
            })
            .map_err(|e| {
                relay_error!(
                    name: "DeliveryPipeline.ThreadStartError",
                    error = format!("{:?}", e)
                );
                MetricError::Other(format!("failed to start delivery worker: {e}"))
            })?;

        Ok(DeliveryPipeline {
            inner,
            signal_sender,
            pool: WorkerPool::new(config.pool_size),
            worker: Mutex::new(Some(Worker {
                handle,
                done: done_receiver,
            })),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    fn run_worker(inner: &PipelineInner, signals: mpsc::Receiver<()>, send_interval: Duration) {
        relay_info!(
            name: "DeliveryPipeline.WorkerStarted",
            send_interval = format!("{:?}", send_interval)
        );
        let mut interval_start = Instant::now();
        loop {
            let remaining_interval = send_interval.saturating_sub(interval_start.elapsed());
            match signals.recv_timeout(remaining_interval) {
                Ok(()) if !inner.is_shutdown.load(Ordering::Acquire) => {
                    inner.flush_in_background("signal");
                }
                Err(mpsc::RecvTimeoutError::Timeout)
                    if !inner.is_shutdown.load(Ordering::Acquire) =>
                {
                    inner.flush_in_background("timer");
                    interval_start = Instant::now();
                }
                _ => {
                    inner.flush_in_background("shutdown");
                    break;
                }
            }
        }
        relay_info!(name: "DeliveryPipeline.WorkerStopped");
    }

    /// Asks for a flush without waiting for it.
    ///
    /// The request is queued for the background worker, or handed to the
    /// overflow pool when the queue is full, or counted as dropped when the
    /// pool is saturated too. After shutdown the request is ignored and not
    /// counted.
    pub fn request_flush(&self) {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            relay_debug!(name: "DeliveryPipeline.RequestAfterShutdown");
            return;
        }

        if self.signal_sender.try_send(()).is_ok() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        match self
            .pool
            .try_submit(move || inner.flush_in_background("overflow"))
        {
            Ok(()) => return,
            // Shutdown started after the check above.
            Err(PoolError::Closed) => {
                relay_debug!(name: "DeliveryPipeline.RequestAfterShutdown");
                return;
            }
            Err(PoolError::Full) => {}
        }

        if self.inner.dropped_requests.fetch_add(1, Ordering::Relaxed) == 0 {
            relay_warn!(
                name: "DeliveryPipeline.RequestDroppingStarted",
                message = "Signal queue and overflow pool are full. Flush requests are being dropped. The total count is reported at shutdown."
            );
        }
    }

    /// Flushes on the calling thread, honouring the rate limit.
    ///
    /// Returns `Ok(())` without calling the exporter client when the rate
    /// limiter skips the flush.
    pub fn flush_sync(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return Err(MetricError::AlreadyShutdown);
        }
        match self.inner.try_flush() {
            Some(result) => result.map_err(MetricError::from),
            None => Ok(()),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped_requests: self.dropped_requests(),
            pool_running: self.pool.running(),
            pool_free: self.pool.free(),
            pool_capacity: self.pool.capacity(),
        }
    }

    /// Number of flush requests dropped so far.
    pub fn dropped_requests(&self) -> u64 {
        self.inner.dropped_requests.load(Ordering::Relaxed)
    }

    /// Returns `true` once shutdown started.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }

    /// Stops the pipeline after a final flush.
    ///
    /// Waits for the worker to finish the final flush and for the overflow
    /// jobs already accepted to complete, both within a single
    /// `shutdown_timeout`. Whatever is still running at the deadline is
    /// detached and a timeout error is returned. A second call returns
    /// [`MetricError::AlreadyShutdown`].
    pub fn shutdown(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MetricError::AlreadyShutdown);
        }
        let deadline = Instant::now() + self.shutdown_timeout;
        // Wakes the worker up. A full queue wakes it up as well.
        let _ = self.signal_sender.try_send(());

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker_stopped = match worker {
            Some(worker) => match worker.done.recv_timeout(self.shutdown_timeout) {
                Err(mpsc::RecvTimeoutError::Timeout) => false,
                _ => {
                    if worker.handle.join().is_err() {
                        relay_error!(name: "DeliveryPipeline.WorkerPanicked");
                    }
                    true
                }
            },
            None => true,
        };
        let result = if !worker_stopped {
            relay_error!(
                name: "DeliveryPipeline.ShutdownTimedOut",
                waiting_for = "worker",
                timeout = format!("{:?}", self.shutdown_timeout)
            );
            self.pool.close();
            Err(MetricError::ExportFailed(ExporterError::Timeout(
                self.shutdown_timeout,
            )))
        } else if !self
            .pool
            .shutdown_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            relay_error!(
                name: "DeliveryPipeline.ShutdownTimedOut",
                waiting_for = "overflow pool",
                pool_running = self.pool.running(),
                timeout = format!("{:?}", self.shutdown_timeout)
            );
            Err(MetricError::ExportFailed(ExporterError::Timeout(
                self.shutdown_timeout,
            )))
        } else {
            Ok(())
        };

        let dropped = self.dropped_requests();
        if dropped > 0 {
            relay_warn!(
                name: "DeliveryPipeline.RequestsDropped",
                dropped_requests = dropped,
                message = "Flush requests were dropped because the signal queue and the overflow pool were full."
            );
        }
        result
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeliveryPipeline, RateLimiter};
    use crate::config::RelayConfig;
    use crate::pool::THREAD_NAME_PREFIX;
    use crate::error::{ExporterError, MetricError};
    use crate::testing::InMemoryExporterClient;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(buffer_size: usize, pool_size: usize) -> RelayConfig {
        RelayConfig::builder()
            .with_buffer_size(buffer_size)
            .with_pool_size(pool_size)
            .with_send_interval(Duration::from_secs(3600))
            .with_min_send_interval(Duration::ZERO)
            .with_shutdown_timeout(WAIT)
            .build()
            .unwrap()
    }

    fn pipeline(config: &RelayConfig) -> (DeliveryPipeline, InMemoryExporterClient) {
        let client = InMemoryExporterClient::default();
        let pipeline = DeliveryPipeline::new(Arc::new(client.clone()), config).unwrap();
        (pipeline, client)
    }

    #[test]
    fn rate_limiter_grants_first_call_then_waits() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn zero_interval_rate_limiter_grants_every_call() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert!((0..100).all(|_| limiter.try_acquire()));
    }

    #[test]
    fn signal_triggers_flush() {
        let (pipeline, client) = pipeline(&config(16, 2));
        pipeline.request_flush();
        assert!(client.wait_for_flushes_started(1, WAIT));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn timer_triggers_flush_without_signals() {
        let config = RelayConfig::builder()
            .with_send_interval(Duration::from_millis(20))
            .with_min_send_interval(Duration::ZERO)
            .build()
            .unwrap();
        let (pipeline, client) = pipeline(&config);

        assert!(client.wait_for_flushes_started(3, WAIT));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn coinciding_sync_flushes_export_once() {
        let config = RelayConfig::builder()
            .with_send_interval(Duration::from_secs(3600))
            .with_min_send_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let (pipeline, client) = pipeline(&config);

        pipeline.flush_sync().unwrap();
        pipeline.flush_sync().unwrap();
        assert_eq!(client.flush_count(), 1);
    }

    #[test]
    fn spaced_sync_flushes_export_each_time() {
        let config = RelayConfig::builder()
            .with_send_interval(Duration::from_secs(3600))
            .with_min_send_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        let (pipeline, client) = pipeline(&config);

        pipeline.flush_sync().unwrap();
        thread::sleep(Duration::from_millis(40));
        pipeline.flush_sync().unwrap();
        assert_eq!(client.flush_count(), 2);
    }

    #[test]
    fn stalled_backend_drops_exactly_the_overflow() {
        let buffer_size = 5;
        let pool_size = 4;
        let (pipeline, client) = pipeline(&config(buffer_size, pool_size));

        // Park the worker inside a flush so it stops draining the queue.
        client.block_flushes();
        pipeline.request_flush();
        assert!(client.wait_for_flushes_started(1, WAIT));

        let threads = 20;
        let requests_per_thread = 10;
        let start = Instant::now();
        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..requests_per_thread {
                        pipeline.request_flush();
                    }
                });
            }
        });
        assert!(start.elapsed() < WAIT);

        let stats = pipeline.stats();
        let total = (threads * requests_per_thread) as u64;
        assert_eq!(
            stats.dropped_requests,
            total - buffer_size as u64 - pool_size as u64
        );
        assert_eq!(stats.pool_capacity, pool_size);
        assert_eq!(stats.pool_running, pool_size);
        assert_eq!(stats.pool_free, 0);

        client.release_flushes();
        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.stats().pool_running, 0);
    }

    #[test]
    fn flush_failures_are_absorbed() {
        let (pipeline, client) = pipeline(&config(16, 2));
        client.fail_flushes(true);

        pipeline.request_flush();
        assert!(client.wait_for_flushes_started(1, WAIT));
        assert_eq!(pipeline.dropped_requests(), 0);

        assert!(matches!(
            pipeline.flush_sync(),
            Err(MetricError::ExportFailed(ExporterError::ExportFailed(_)))
        ));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn shutdown_performs_final_flush() {
        let (pipeline, client) = pipeline(&config(16, 2));
        pipeline.shutdown().unwrap();
        assert_eq!(client.flush_count(), 1);
    }

    #[test]
    fn shutdown_twice_returns_already_shutdown() {
        let (pipeline, _client) = pipeline(&config(16, 2));
        pipeline.shutdown().unwrap();
        assert!(matches!(
            pipeline.shutdown(),
            Err(MetricError::AlreadyShutdown)
        ));
    }

    #[test]
    fn requests_after_shutdown_are_ignored() {
        let (pipeline, client) = pipeline(&config(1, 1));
        pipeline.shutdown().unwrap();
        let flushes = client.flushes_started();

        for _ in 0..10 {
            pipeline.request_flush();
        }

        assert_eq!(pipeline.dropped_requests(), 0);
        assert!(matches!(
            pipeline.flush_sync(),
            Err(MetricError::AlreadyShutdown)
        ));
        assert_eq!(client.flushes_started(), flushes);
    }

    #[test]
    fn shutdown_gives_up_on_stuck_final_flush() {
        let config = RelayConfig::builder()
            .with_send_interval(Duration::from_secs(3600))
            .with_min_send_interval(Duration::ZERO)
            .with_shutdown_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let (pipeline, client) = pipeline(&config);
        client.block_flushes();
        pipeline.request_flush();
        assert!(client.wait_for_flushes_started(1, WAIT));

        let start = Instant::now();
        let result = pipeline.shutdown();
        assert!(start.elapsed() < WAIT);
        assert!(matches!(
            result,
            Err(MetricError::ExportFailed(ExporterError::Timeout(_)))
        ));
        client.release_flushes();
    }

    #[test]
    fn shutdown_gives_up_on_stuck_overflow_flushes() {
        let config = RelayConfig::builder()
            .with_buffer_size(1)
            .with_pool_size(2)
            .with_send_interval(Duration::from_secs(3600))
            .with_min_send_interval(Duration::ZERO)
            .with_shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let (pipeline, client) = pipeline(&config);
        // Only the pool threads stall; the worker keeps draining the queue
        // and its final flush completes.
        client.block_flushes_on_threads(THREAD_NAME_PREFIX);

        let deadline = Instant::now() + WAIT;
        while pipeline.stats().pool_running < 2 {
            assert!(Instant::now() < deadline, "overflow pool never filled up");
            pipeline.request_flush();
        }

        let start = Instant::now();
        let result = pipeline.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            result,
            Err(MetricError::ExportFailed(ExporterError::Timeout(_)))
        ));
        client.release_flushes();
    }

    #[test]
    fn requests_racing_shutdown_are_not_dropped() {
        let buffer_size = 2;
        let (pipeline, client) = pipeline(&config(buffer_size, 2));
        client.block_flushes();
        pipeline.request_flush();
        assert!(client.wait_for_flushes_started(1, WAIT));
        for _ in 0..buffer_size {
            pipeline.request_flush();
        }
        // The pool refuses work as it does once a concurrent shutdown closed it.
        pipeline.pool.close();

        for _ in 0..10 {
            pipeline.request_flush();
        }

        assert_eq!(pipeline.dropped_requests(), 0);
        client.release_flushes();
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn drop_shuts_down() {
        let client = InMemoryExporterClient::default();
        {
            let _pipeline =
                DeliveryPipeline::new(Arc::new(client.clone()), &config(16, 2)).unwrap();
        }
        assert_eq!(client.flush_count(), 1);
    }
}
