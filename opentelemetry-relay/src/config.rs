//! Relay configuration.
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MetricError, MetricResult};

/// Logical service name, attached to every instrument as `service.name`.
pub(crate) const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Default service name.
pub(crate) const OTEL_SERVICE_NAME_DEFAULT: &str = "unknown_service";
/// Service version, reported as a resource attribute.
pub(crate) const OTEL_RELAY_SERVICE_VERSION: &str = "OTEL_RELAY_SERVICE_VERSION";
/// Default service version.
pub(crate) const OTEL_RELAY_SERVICE_VERSION_DEFAULT: &str = "0.0.0";
/// Deployment environment, attached to every instrument as `environment`.
pub(crate) const OTEL_RELAY_ENVIRONMENT: &str = "OTEL_RELAY_ENVIRONMENT";
/// Default deployment environment.
pub(crate) const OTEL_RELAY_ENVIRONMENT_DEFAULT: &str = "development";
/// Capacity of the flush signal queue.
pub(crate) const OTEL_RELAY_BUFFER_SIZE: &str = "OTEL_RELAY_BUFFER_SIZE";
/// Default capacity of the flush signal queue.
pub(crate) const OTEL_RELAY_BUFFER_SIZE_DEFAULT: usize = 100_000;
/// Interval in milliseconds between two periodic flushes.
pub(crate) const OTEL_RELAY_SEND_INTERVAL: &str = "OTEL_RELAY_SEND_INTERVAL";
/// Default interval between two periodic flushes.
pub(crate) const OTEL_RELAY_SEND_INTERVAL_DEFAULT: Duration = Duration::from_secs(30);
/// Minimum time in milliseconds between two flushes, whatever triggered them.
pub(crate) const OTEL_RELAY_MIN_SEND_INTERVAL: &str = "OTEL_RELAY_MIN_SEND_INTERVAL";
/// Default minimum time between two flushes.
pub(crate) const OTEL_RELAY_MIN_SEND_INTERVAL_DEFAULT: Duration = Duration::from_millis(10);
/// Number of threads of the overflow pool.
pub(crate) const OTEL_RELAY_POOL_SIZE: &str = "OTEL_RELAY_POOL_SIZE";
/// Default number of threads of the overflow pool.
pub(crate) const OTEL_RELAY_POOL_SIZE_DEFAULT: usize = 10;
/// Time in milliseconds shutdown waits for the final flush.
pub(crate) const OTEL_RELAY_SHUTDOWN_TIMEOUT: &str = "OTEL_RELAY_SHUTDOWN_TIMEOUT";
/// Default time shutdown waits for the final flush.
pub(crate) const OTEL_RELAY_SHUTDOWN_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Validated relay configuration. Built with [`RelayConfig::builder`].
#[derive(Clone, Debug, PartialEq)]
pub struct RelayConfig {
    pub(crate) service_name: String,
    pub(crate) service_version: String,
    pub(crate) environment: String,
    pub(crate) buffer_size: usize,
    pub(crate) send_interval: Duration,
    pub(crate) min_send_interval: Duration,
    pub(crate) pool_size: usize,
    pub(crate) shutdown_timeout: Duration,
}

impl RelayConfig {
    /// Returns a builder initialized from the defaults and the environment.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Logical service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Service version.
    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Deployment environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Capacity of the flush signal queue.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Interval between two periodic flushes.
    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    /// Minimum time between two flushes.
    pub fn min_send_interval(&self) -> Duration {
        self.min_send_interval
    }

    /// Number of threads of the overflow pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Time shutdown waits for the final flush.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

/// A builder for creating [`RelayConfig`] instances.
#[derive(Debug)]
pub struct RelayConfigBuilder {
    service_name: String,
    service_version: String,
    environment: String,
    buffer_size: usize,
    send_interval: Duration,
    min_send_interval: Duration,
    pool_size: usize,
    shutdown_timeout: Duration,
}

impl Default for RelayConfigBuilder {
    /// Create a new [`RelayConfigBuilder`] initialized with the default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `OTEL_SERVICE_NAME`
    /// * `OTEL_RELAY_SERVICE_VERSION`
    /// * `OTEL_RELAY_ENVIRONMENT`
    /// * `OTEL_RELAY_BUFFER_SIZE`
    /// * `OTEL_RELAY_SEND_INTERVAL`
    /// * `OTEL_RELAY_MIN_SEND_INTERVAL`
    /// * `OTEL_RELAY_POOL_SIZE`
    /// * `OTEL_RELAY_SHUTDOWN_TIMEOUT`
    ///
    /// Note: Programmatic configuration overrides any value set via the environment variable.
    fn default() -> Self {
        RelayConfigBuilder {
            service_name: OTEL_SERVICE_NAME_DEFAULT.to_owned(),
            service_version: OTEL_RELAY_SERVICE_VERSION_DEFAULT.to_owned(),
            environment: OTEL_RELAY_ENVIRONMENT_DEFAULT.to_owned(),
            buffer_size: OTEL_RELAY_BUFFER_SIZE_DEFAULT,
            send_interval: OTEL_RELAY_SEND_INTERVAL_DEFAULT,
            min_send_interval: OTEL_RELAY_MIN_SEND_INTERVAL_DEFAULT,
            pool_size: OTEL_RELAY_POOL_SIZE_DEFAULT,
            shutdown_timeout: OTEL_RELAY_SHUTDOWN_TIMEOUT_DEFAULT,
        }
        .init_from_env_vars()
    }
}

impl RelayConfigBuilder {
    /// Set the logical service name. The default value is `unknown_service`.
    ///
    /// Corresponding environment variable: `OTEL_SERVICE_NAME`.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Set the service version. The default value is `0.0.0`.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_SERVICE_VERSION`.
    pub fn with_service_version(mut self, service_version: impl Into<String>) -> Self {
        self.service_version = service_version.into();
        self
    }

    /// Set the deployment environment. The default value is `development`.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_ENVIRONMENT`.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the capacity of the flush signal queue. Requests that find the
    /// queue full fall back to the overflow pool.
    /// The default value is 100000.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_BUFFER_SIZE`.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the interval between two periodic flushes.
    /// The default value is 30 seconds.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_SEND_INTERVAL`.
    pub fn with_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }

    /// Set the minimum time between two flushes. Flushes triggered sooner are
    /// skipped. Zero disables rate limiting.
    /// The default value is 10 milliseconds.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_MIN_SEND_INTERVAL`.
    pub fn with_min_send_interval(mut self, min_send_interval: Duration) -> Self {
        self.min_send_interval = min_send_interval;
        self
    }

    /// Set the number of threads of the overflow pool.
    /// The default value is 10.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_POOL_SIZE`.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set how long shutdown waits for the final flush.
    /// The default value is 5 seconds.
    ///
    /// Corresponding environment variable: `OTEL_RELAY_SHUTDOWN_TIMEOUT`.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Builds a `RelayConfig` enforcing the following invariants:
    /// * `service_name` and `environment` are not empty.
    /// * `buffer_size`, `send_interval`, `pool_size` and `shutdown_timeout` are not zero.
    /// * `min_send_interval` is not larger than `send_interval`.
    pub fn build(self) -> MetricResult<RelayConfig> {
        if self.service_name.is_empty() {
            return Err(MetricError::Config("service name must not be empty".into()));
        }
        if self.environment.is_empty() {
            return Err(MetricError::Config("environment must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(MetricError::Config("buffer size must be positive".into()));
        }
        if self.send_interval.is_zero() {
            return Err(MetricError::Config("send interval must be positive".into()));
        }
        if self.min_send_interval > self.send_interval {
            return Err(MetricError::Config(format!(
                "min send interval {:?} is larger than send interval {:?}",
                self.min_send_interval, self.send_interval
            )));
        }
        if self.pool_size == 0 {
            return Err(MetricError::Config("pool size must be positive".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(MetricError::Config(
                "shutdown timeout must be positive".into(),
            ));
        }

        Ok(RelayConfig {
            service_name: self.service_name,
            service_version: self.service_version,
            environment: self.environment,
            buffer_size: self.buffer_size,
            send_interval: self.send_interval,
            min_send_interval: self.min_send_interval,
            pool_size: self.pool_size,
            shutdown_timeout: self.shutdown_timeout,
        })
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(service_name) = env::var(OTEL_SERVICE_NAME).ok().filter(|s| !s.is_empty()) {
            self.service_name = service_name;
        }

        if let Some(service_version) = env::var(OTEL_RELAY_SERVICE_VERSION)
            .ok()
            .filter(|s| !s.is_empty())
        {
            self.service_version = service_version;
        }

        if let Some(environment) = env::var(OTEL_RELAY_ENVIRONMENT)
            .ok()
            .filter(|s| !s.is_empty())
        {
            self.environment = environment;
        }

        if let Some(buffer_size) = env::var(OTEL_RELAY_BUFFER_SIZE)
            .ok()
            .and_then(|size| usize::from_str(&size).ok())
        {
            self.buffer_size = buffer_size;
        }

        if let Some(send_interval) = env::var(OTEL_RELAY_SEND_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
        {
            self.send_interval = Duration::from_millis(send_interval);
        }

        if let Some(min_send_interval) = env::var(OTEL_RELAY_MIN_SEND_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
        {
            self.min_send_interval = Duration::from_millis(min_send_interval);
        }

        if let Some(pool_size) = env::var(OTEL_RELAY_POOL_SIZE)
            .ok()
            .and_then(|size| usize::from_str(&size).ok())
        {
            self.pool_size = pool_size;
        }

        if let Some(shutdown_timeout) = env::var(OTEL_RELAY_SHUTDOWN_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.shutdown_timeout = Duration::from_millis(shutdown_timeout);
        }

        self
    }
}
