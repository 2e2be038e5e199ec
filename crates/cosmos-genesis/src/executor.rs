//! Submit, poll and fetch one query against a [`QueryService`].
//!
//! [`QueryExecutor`] owns the per-call state machine:
//!
//! ```text
//! rewrite -> submit -> poll -> {succeeded | failed | cancelled | timed out} -> fetch -> map
//! ```
//!
//! Each remote call is retried on transient failures according to [`RetryConfig`]. Terminal
//! `FAILED`/`CANCELLED` states are never retried. While polling, status calls and the retry
//! sleeps between them are bounded by the query timeout, whatever the service asks for.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::instrument;

use crate::cancel_token::CancellationListener;
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{CosmosError, QueryError, Stage};
use crate::query::{PartitionFilter, PredicateInjector, TextualInjector};
use crate::result::{QueryResult, RawRow};
use crate::service::{ExecutionId, ExecutionState, QueryService, ServiceError, StartQuery};

const UNKNOWN_REASON: &str = "Unknown error";

/// A caller query pinned to one galaxy partition, with the rewritten SQL that will be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    partition: String,
    sql: String,
    universe_time: u64,
    effective_sql: String,
}

impl ExecutionRequest {
    pub fn new(galaxy_id: impl Into<String>, sql: impl Into<String>, universe_time: u64) -> Self {
        Self::with_injector(&TextualInjector, galaxy_id, sql, universe_time)
    }

    pub fn with_injector<I: PredicateInjector + ?Sized>(
        injector: &I,
        galaxy_id: impl Into<String>,
        sql: impl Into<String>,
        universe_time: u64,
    ) -> Self {
        let partition = galaxy_id.into();
        let sql = sql.into();
        let filter = PartitionFilter::new(&partition).at_universe_time(universe_time);
        let effective_sql = injector.inject(&sql, &filter);
        Self {
            partition,
            sql,
            universe_time,
            effective_sql,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// The SQL as the caller wrote it.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn universe_time(&self) -> u64 {
        self.universe_time
    }

    /// The SQL actually submitted.
    pub fn effective_sql(&self) -> &str {
        &self.effective_sql
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub database: String,
    pub output_location: String,
    /// Bound on the time between submission and the last status check.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

impl ExecutorSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            database: config.database().to_string(),
            output_location: config.output_location(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            retry: *config.retry(),
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
enum CallError {
    Service(ServiceError),
    Cancelled,
    /// The call or a retry sleep ran into the caller's deadline.
    DeadlineExceeded,
}

#[derive(Debug)]
pub struct QueryExecutor<S> {
    service: S,
    settings: ExecutorSettings,
}

impl<S: QueryService> QueryExecutor<S> {
    pub fn new(service: S, settings: ExecutorSettings) -> Self {
        Self { service, settings }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run a partitioned query to completion and map its rows.
    #[instrument(
        skip_all,
        target = "cosmos-query",
        fields(galaxy_id = %request.partition(), universe_time = request.universe_time())
    )]
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: Option<&CancellationListener>,
    ) -> Result<QueryResult, CosmosError> {
        tracing::debug!(target: "cosmos-query", sql = %request.effective_sql(), "rewrote query");
        self.run_sql(request.effective_sql(), cancel).await
    }

    /// Run `sql` as given, without partition injection.
    #[instrument(skip_all, target = "cosmos-query")]
    pub async fn run_sql(
        &self,
        sql: &str,
        cancel: Option<&CancellationListener>,
    ) -> Result<QueryResult, CosmosError> {
        if cancel.is_some_and(CancellationListener::is_cancelled) {
            return Err(QueryError::Cancelled { execution_id: None }.into());
        }

        let id = self.submit(sql, cancel).await?;
        self.wait_for_completion(&id, cancel).await?;
        let (column_names, rows) = self.fetch_all(&id, cancel).await?;
        Ok(QueryResult::from_rows(column_names, rows))
    }

    async fn submit(
        &self,
        sql: &str,
        cancel: Option<&CancellationListener>,
    ) -> Result<ExecutionId, CosmosError> {
        // One token for every attempt, so a retried submission cannot start a second execution.
        let request = StartQuery {
            sql: sql.to_string(),
            database: self.settings.database.clone(),
            output_location: self.settings.output_location.clone(),
            client_request_token: uuid::Uuid::new_v4().to_string(),
        };

        let id = match self
            .call_with_retry("start_query", cancel, None, || {
                self.service.start_query(&request)
            })
            .await
        {
            Ok(id) => id,
            Err(CallError::Cancelled) => {
                return Err(QueryError::Cancelled { execution_id: None }.into());
            }
            Err(CallError::Service(e)) => return Err(e.into_cosmos(Stage::Submit)),
            Err(CallError::DeadlineExceeded) => {
                return Err(QueryError::Submission {
                    message: "submission deadline exceeded".into(),
                }
                .into());
            }
        };
        tracing::debug!(target: "cosmos-query", execution_id = %id, "query submitted");
        Ok(id)
    }

    async fn wait_for_completion(
        &self,
        id: &ExecutionId,
        cancel: Option<&CancellationListener>,
    ) -> Result<(), CosmosError> {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut checks = 0u32;
        loop {
            let status = match self
                .call_with_retry("execution_status", cancel, Some(deadline), || {
                    self.service.execution_status(id)
                })
                .await
            {
                Ok(status) => status,
                Err(CallError::Cancelled) => return Err(self.stop(id).await),
                Err(CallError::Service(e)) => return Err(e.into_cosmos(Stage::Poll)),
                Err(CallError::DeadlineExceeded) => return Err(self.timed_out(id)),
            };
            checks += 1;
            tracing::debug!(target: "cosmos-query", execution_id = %id, state = %status.state, checks, "polled");

            match status.state {
                ExecutionState::Succeeded => return Ok(()),
                state @ (ExecutionState::Failed | ExecutionState::Cancelled) => {
                    return Err(QueryError::Failed {
                        execution_id: id.clone(),
                        state,
                        reason: status.reason.unwrap_or_else(|| UNKNOWN_REASON.to_string()),
                    }
                    .into());
                }
                ExecutionState::Queued | ExecutionState::Running | ExecutionState::Unknown => {}
            }

            if started.elapsed() > self.settings.timeout {
                return Err(self.timed_out(id));
            }

            if wait_cancel_or_sleep(cancel, self.settings.poll_interval)
                .await
                .is_err()
            {
                return Err(self.stop(id).await);
            }
        }
    }

    fn timed_out(&self, id: &ExecutionId) -> CosmosError {
        tracing::warn!(target: "cosmos-query", execution_id = %id, timeout = ?self.settings.timeout, "query timed out");
        QueryError::Timeout {
            execution_id: id.clone(),
            timeout: self.settings.timeout,
        }
        .into()
    }

    /// Pages in service order, with each page's header row dropped.
    async fn fetch_all(
        &self,
        id: &ExecutionId,
        cancel: Option<&CancellationListener>,
    ) -> Result<(Option<Vec<String>>, Vec<RawRow>), CosmosError> {
        let mut rows: Vec<RawRow> = Vec::new();
        let mut column_names = None;
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self
                .call_with_retry("fetch_results", cancel, None, || {
                    self.service.fetch_results(id, next_token.as_deref())
                })
                .await
            {
                Ok(page) => page,
                Err(CallError::Cancelled) => {
                    return Err(QueryError::Cancelled {
                        execution_id: Some(id.clone()),
                    }
                    .into());
                }
                Err(CallError::Service(e)) => return Err(e.into_cosmos(Stage::Fetch)),
                Err(CallError::DeadlineExceeded) => {
                    return Err(QueryError::Execution {
                        message: format!("fetching results of {id} exceeded its deadline"),
                    }
                    .into());
                }
            };
            pages += 1;
            if column_names.is_none() {
                column_names = page.column_names;
            }
            rows.extend(page.rows.into_iter().skip(1));

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(target: "cosmos-query", execution_id = %id, pages, rows = rows.len(), "fetched results");
        Ok((column_names, rows))
    }

    /// Ask the service to stop `id` after the caller cancelled.
    async fn stop(&self, id: &ExecutionId) -> CosmosError {
        tracing::info!(target: "cosmos-query", execution_id = %id, "cancellation requested; stopping query");
        match self
            .call_with_retry("stop_query", None, None, || self.service.stop_query(id))
            .await
        {
            Ok(()) => QueryError::Cancelled {
                execution_id: Some(id.clone()),
            }
            .into(),
            Err(CallError::Service(e)) => e.into_cosmos(Stage::Stop),
            Err(CallError::Cancelled | CallError::DeadlineExceeded) => QueryError::Cancelled {
                execution_id: Some(id.clone()),
            }
            .into(),
        }
    }

    /// Retry `call` on transient errors. With a `deadline`, each attempt is cut off at the
    /// deadline and retry sleeps never extend past it.
    async fn call_with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: Option<&CancellationListener>,
        deadline: Option<Instant>,
        mut call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let retry = &self.settings.retry;
        let mut attempt = 1;
        loop {
            let outcome = match deadline {
                // an already finished call still wins over an expired deadline
                Some(deadline) => time::timeout_at(deadline, call())
                    .await
                    .map_err(|_| CallError::DeadlineExceeded)?,
                None => call().await,
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= retry.max_attempts {
                return Err(CallError::Service(err));
            }

            let mut delay = match err.retry_after() {
                Some(hint) => hint.min(retry.max_backoff()),
                None => retry.delay_for_attempt(attempt),
            };
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(CallError::DeadlineExceeded);
                }
                delay = delay.min(remaining);
            }
            tracing::warn!(
                target: "cosmos-query",
                op,
                attempt,
                max_attempts = retry.max_attempts,
                ?delay,
                error = %err,
                "transient query service failure; retrying"
            );
            if wait_cancel_or_sleep(cancel, delay).await.is_err() {
                return Err(CallError::Cancelled);
            }
            attempt += 1;
        }
    }
}

/// Sleep for `dur`, returning early with `Err(())` if `cancel` fires first.
async fn wait_cancel_or_sleep(
    cancel: Option<&CancellationListener>,
    dur: Duration,
) -> Result<(), ()> {
    if let Some(cancel) = cancel {
        tokio::select! {
            _ = cancel.cancelled() => Err(()),
            _ = time::sleep(dur) => Ok(()),
        }
    } else {
        time::sleep(dur).await;
        Ok(())
    }
}
