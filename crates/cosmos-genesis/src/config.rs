//! Client configuration.
//!
//! [`ClientOptions`] is the mutable, layered input: defaults, then an optional TOML file, then
//! `COSMOS_*` environment variables. [`ClientOptions::resolve`] validates it and attaches the
//! credential, producing the immutable [`ClientConfig`] a client is built from.
//!
//! The credential never comes from the configuration file. It is passed explicitly or read from
//! [`API_KEY_ENV`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CosmosError;

pub const API_KEY_ENV: &str = "COSMOS_API_KEY";
pub const ENV_PREFIX: &str = "COSMOS";

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DATABASE: &str = "cosmological_production";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Bounded retry for individual remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all; every transient failure surfaces immediately.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Exponential backoff before retrying after `attempt` failed, without jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        // attempt is 1-based; attempt=1 => initial backoff.
        let shift = attempt.saturating_sub(1).min(16);
        let backoff = self.initial_backoff().saturating_mul(1u32 << shift);
        std::cmp::min(backoff, self.max_backoff())
    }

    /// [`Self::backoff_for_attempt`], randomised into `[backoff/2, backoff]` when jitter is on.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        if !self.jitter {
            return backoff;
        }
        let full = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        let millis = rand::rng().random_range(full / 2..=full);
        Duration::from_millis(millis)
    }
}

/// Layered, not yet validated client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub region: String,
    pub timeout_secs: u64,
    pub database: String,
    pub poll_interval_ms: u64,
    /// Bound on a single HTTP call to the service, connect included.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Overrides the regional query endpoint, e.g. for a proxy or a local gateway.
    pub endpoint: Option<Url>,
    /// Max rows requested per results page. Service default when unset.
    pub page_size: Option<u32>,
    pub retry: RetryConfig,
    #[serde(skip)]
    api_key: Option<ApiKey>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            database: DEFAULT_DATABASE.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            endpoint: None,
            page_size: None,
            retry: RetryConfig::default(),
            api_key: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config_dir>/cosmos-genesis/config.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cosmos-genesis").join("config.toml"))
    }

    /// Defaults, then the default config file if present, then the environment.
    pub fn load_default() -> Result<Self, CosmosError> {
        Self::load(None)
    }

    /// Like [`Self::load_default`], but an explicit `path` must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, CosmosError> {
        Self::load_from(path, None)
    }

    /// Layered load with the environment replaced by `env` when given.
    pub(crate) fn load_from(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, CosmosError> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default) = Self::default_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let options = builder
            .add_source(environment)
            .build()?
            .try_deserialize::<ClientOptions>()?;
        tracing::debug!(target: "cosmos-query", region = %options.region, database = %options.database, "loaded client options");
        Ok(options)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(ApiKey::new(api_key));
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Whole seconds, rounded up so a sub-second timeout stays positive.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = ceil_secs(timeout);
        self
    }

    /// Per-request HTTP timeout, rounded up to whole seconds.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = ceil_secs(timeout);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validate and attach the credential, reading [`API_KEY_ENV`] if none was given.
    pub fn resolve(self) -> Result<ClientConfig, CosmosError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// [`Self::resolve`] with a custom environment lookup.
    pub fn resolve_with<F>(self, lookup: F) -> Result<ClientConfig, CosmosError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = self
            .api_key
            .filter(|key| !key.is_blank())
            .or_else(|| lookup(API_KEY_ENV).map(ApiKey::new))
            .filter(|key| !key.is_blank())
            .ok_or_else(CosmosError::missing_credential)?;

        let region = self.region.trim().to_string();
        if region.is_empty() {
            return Err(CosmosError::Config("region must not be empty".into()));
        }
        if self.database.trim().is_empty() {
            return Err(CosmosError::Config("database must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return Err(CosmosError::Config("timeout_secs must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CosmosError::Config(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(CosmosError::Config(
                "request_timeout_secs and connect_timeout_secs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CosmosError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        let endpoint = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(&format!("https://{region}.query.cosmosgenesis.com/")).map_err(
                |e| CosmosError::Config(format!("invalid endpoint for region {region:?}: {e}")),
            )?,
        };

        Ok(ClientConfig {
            api_key,
            region,
            timeout: Duration::from_secs(self.timeout_secs),
            database: self.database,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            endpoint,
            page_size: self.page_size,
            retry: self.retry,
        })
    }
}

/// Validated, immutable settings of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    api_key: ApiKey,
    region: String,
    timeout: Duration,
    database: String,
    poll_interval: Duration,
    request_timeout: Duration,
    connect_timeout: Duration,
    endpoint: Url,
    page_size: Option<u32>,
    retry: RetryConfig,
}

impl ClientConfig {
    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn results_bucket(&self) -> String {
        format!("cosmos-query-results-{}", self.region)
    }

    /// Where the service writes result files for this client's queries.
    pub fn output_location(&self) -> String {
        format!("s3://{}/queries/", self.results_bucket())
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}
