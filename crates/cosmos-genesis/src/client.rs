use serde::Serialize;
use tokio::runtime::{Builder, Runtime};

use crate::cancel_token::CancellationListener;
use crate::capability::{self, Availability, Capability, Frame};
use crate::config::{ClientConfig, ClientOptions};
use crate::error::{CosmosError, QueryError};
use crate::executor::{ExecutionRequest, ExecutorSettings, QueryExecutor};
use crate::result::QueryResult;
use crate::service::{HttpQueryService, QueryService};

/// One row of [`CosmosClient::list_galaxies`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GalaxySummary {
    pub galaxy_id: String,
    pub system_count: u64,
}

/// Blocking client for the hosted query service.
///
/// Every call blocks the current thread until the query reaches a terminal state, the configured
/// timeout passes, or the caller cancels. The client drives its own single-threaded runtime, so
/// it must not be used from inside an async context; use [`QueryExecutor`] there instead.
#[derive(Debug)]
pub struct CosmosClient<S = HttpQueryService> {
    config: ClientConfig,
    executor: QueryExecutor<S>,
    runtime: Runtime,
}

impl CosmosClient<HttpQueryService> {
    /// Resolve `options` and connect over HTTP.
    ///
    /// Fails with an authentication error, before any network activity, when neither
    /// `options` nor `COSMOS_API_KEY` carry a credential.
    pub fn new(options: ClientOptions) -> Result<Self, CosmosError> {
        Self::from_config(options.resolve()?)
    }

    /// [`ClientOptions::load_default`] followed by [`Self::new`].
    pub fn from_env() -> Result<Self, CosmosError> {
        Self::new(ClientOptions::load_default()?)
    }

    pub fn from_config(config: ClientConfig) -> Result<Self, CosmosError> {
        let service = HttpQueryService::from_config(&config)?;
        Self::with_service(config, service)
    }
}

impl<S: QueryService> CosmosClient<S> {
    pub fn with_service(config: ClientConfig, service: S) -> Result<Self, CosmosError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CosmosError::Config(format!("failed to start client runtime: {e}")))?;
        let executor = QueryExecutor::new(service, ExecutorSettings::from_config(&config));
        tracing::debug!(
            target: "cosmos-query",
            region = %config.region(),
            database = %config.database(),
            endpoint = %config.endpoint(),
            "client ready"
        );
        Ok(Self {
            config,
            executor,
            runtime,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &QueryExecutor<S> {
        &self.executor
    }

    /// Run `sql` against one galaxy. `universe_time` of 0 leaves time unfiltered.
    pub fn query_galaxy(
        &self,
        galaxy_id: &str,
        sql: &str,
        universe_time: u64,
    ) -> Result<QueryResult, CosmosError> {
        let request = ExecutionRequest::new(galaxy_id, sql, universe_time);
        self.runtime.block_on(self.executor.execute(&request, None))
    }

    /// [`Self::query_galaxy`], stopping the remote query when `cancel` fires.
    pub fn query_galaxy_with_cancel(
        &self,
        galaxy_id: &str,
        sql: &str,
        universe_time: u64,
        cancel: &CancellationListener,
    ) -> Result<QueryResult, CosmosError> {
        let request = ExecutionRequest::new(galaxy_id, sql, universe_time);
        self.runtime.block_on(self.executor.execute(&request, Some(cancel)))
    }

    /// Every galaxy in the database with its star system count, ordered by id.
    pub fn list_galaxies(&self) -> Result<Vec<GalaxySummary>, CosmosError> {
        let sql = format!(
            "SELECT DISTINCT galaxy_id, COUNT(*) as system_count FROM {}.starsystem GROUP BY galaxy_id ORDER BY galaxy_id",
            self.config.database()
        );
        let result = self.runtime.block_on(self.executor.run_sql(&sql, None))?;
        result
            .iter()
            .map(|row| -> Result<GalaxySummary, CosmosError> {
                let galaxy_id = row.value_at(0).ok_or_else(|| QueryError::Execution {
                    message: "galaxy listing returned a row without galaxy_id".into(),
                })?;
                let count = row.value_at(1).unwrap_or("0");
                let system_count = count.trim().parse::<u64>().map_err(|e| {
                    QueryError::Execution {
                        message: format!("invalid system_count {count:?} for {galaxy_id}: {e}"),
                    }
                })?;
                Ok(GalaxySummary {
                    galaxy_id: galaxy_id.to_string(),
                    system_count,
                })
            })
            .collect()
    }

    /// [`Self::query_galaxy`] as an Arrow record batch. Needs the `frame` feature.
    ///
    /// Without the feature this fails before the query is submitted.
    pub fn query_to_frame(
        &self,
        galaxy_id: &str,
        sql: &str,
        universe_time: u64,
    ) -> Result<Frame, CosmosError> {
        Capability::TabularFrame.ensure_available()?;
        let result = self.query_galaxy(galaxy_id, sql, universe_time)?;
        capability::to_frame(&result)
    }

    /// Schema lookup is not available yet and always fails with [`CosmosError::NotSupported`].
    pub fn get_schema(&self, _name: &str) -> Result<serde_json::Value, CosmosError> {
        Capability::SchemaLookup.ensure_available()?;
        Err(CosmosError::NotSupported(Capability::SchemaLookup))
    }

    pub fn capabilities(&self) -> Vec<(Capability, Availability)> {
        Capability::ALL
            .iter()
            .map(|cap| (*cap, cap.availability()))
            .collect()
    }
}

/// Natively asynchronous client. Not available yet; construction always fails.
#[derive(Debug)]
pub struct AsyncCosmosClient {
    _private: (),
}

impl AsyncCosmosClient {
    pub fn new(_options: ClientOptions) -> Result<Self, CosmosError> {
        Capability::AsyncClient.ensure_available()?;
        Err(CosmosError::NotSupported(Capability::AsyncClient))
    }
}
