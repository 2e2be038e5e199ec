use std::time::Duration;

use cosmos_genesis::{
    CancellationToken, CosmosError, ExecutionId, ExecutionRequest, ExecutionState,
    ExecutionStatus, ExecutorSettings, QueryError, QueryExecutor, QueryService, ResultPage,
    RetryConfig, ServiceError, StartQuery,
};
use cosmos_test_utils::{ScriptedQueryService, init_tracing_tests, raw_row};
use tokio::time::Instant;
use tracing::Level;

fn settings(timeout_secs: u64) -> ExecutorSettings {
    ExecutorSettings {
        database: "cosmological_production".into(),
        output_location: "s3://cosmos-query-results-us-east-1/queries/".into(),
        timeout: Duration::from_secs(timeout_secs),
        poll_interval: Duration::from_secs(1),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
        },
    }
}

fn throttled(retry_after: Option<Duration>) -> ServiceError {
    ServiceError::Throttled {
        url: "http://gateway/".into(),
        retry_after,
    }
}

/// Accepts submissions, then never answers a status check.
struct UnresponsiveStatus;

impl QueryService for UnresponsiveStatus {
    async fn start_query(&self, _request: &StartQuery) -> Result<ExecutionId, ServiceError> {
        Ok(ExecutionId::new("q-hung"))
    }

    async fn execution_status(&self, _id: &ExecutionId) -> Result<ExecutionStatus, ServiceError> {
        std::future::pending().await
    }

    async fn fetch_results(
        &self,
        _id: &ExecutionId,
        _next_token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        Ok(ResultPage::default())
    }

    async fn stop_query(&self, _id: &ExecutionId) -> Result<(), ServiceError> {
        Ok(())
    }
}

fn request() -> ExecutionRequest {
    ExecutionRequest::new("spiral-sm-2arm-001", "SELECT system_id FROM star LIMIT 5", 0)
}

#[tokio::test(start_paused = true)]
async fn succeeded_query_is_fetched_and_mapped() {
    init_tracing_tests(Level::DEBUG);
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status(ExecutionState::Queued)
        .status(ExecutionState::Running)
        .status(ExecutionState::Succeeded)
        .page(
            &["system_id"],
            vec![raw_row(&[Some("sys-1")]), raw_row(&[Some("sys-2")])],
            Some(&["system_id"]),
            None,
        );
    let executor = QueryExecutor::new(service, settings(300));

    let result = executor.execute(&request(), None).await.expect("query");

    assert_eq!(result.len(), 2);
    assert_eq!(result.rows()[0].get("system_id"), Some("sys-1"));
    let service = executor.service();
    assert_eq!(service.status_checks(), 3);
    assert_eq!(service.fetch_tokens(), vec![None]);

    let submitted = service.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(
        submitted[0].sql,
        "SELECT system_id FROM star WHERE galaxy_id = 'spiral-sm-2arm-001' LIMIT 5"
    );
    assert_eq!(submitted[0].database, "cosmological_production");
    assert_eq!(
        submitted[0].output_location,
        "s3://cosmos-query-results-us-east-1/queries/"
    );
}

#[tokio::test(start_paused = true)]
async fn failed_query_carries_reason_and_skips_fetch() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status(ExecutionState::Running)
        .status_with_reason(ExecutionState::Failed, "TABLE_NOT_FOUND: starz");
    let executor = QueryExecutor::new(service, settings(300));

    let err = executor.execute(&request(), None).await.expect_err("failed");

    assert_eq!(err.to_string(), "Query failed: TABLE_NOT_FOUND: starz");
    assert!(executor.service().fetch_tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_cancel_without_reason_reports_unknown_error() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status(ExecutionState::Cancelled);
    let executor = QueryExecutor::new(service, settings(300));

    let err = executor.execute(&request(), None).await.expect_err("cancelled");
    match err {
        CosmosError::Query(QueryError::Failed { state, reason, .. }) => {
            assert_eq!(state, ExecutionState::Cancelled);
            assert_eq!(reason, "Unknown error");
        }
        other => panic!("unexpected error variant {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn never_terminal_query_times_out_without_further_checks() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .then_always(ExecutionState::Running);
    let executor = QueryExecutor::new(service, settings(5));

    let err = executor.execute(&request(), None).await.expect_err("timeout");

    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(err.to_string(), "Query timeout after 5s");
    // checks at t=0..=6s; the one at 6s is past the bound and nothing follows it
    assert_eq!(executor.service().status_checks(), 7);
    assert!(executor.service().fetch_tokens().is_empty());
    assert_eq!(executor.service().stop_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn header_row_is_skipped_on_every_page() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status(ExecutionState::Succeeded)
        .page(
            &["galaxy_id", "mass"],
            vec![
                raw_row(&[Some("g1"), Some("1.0")]),
                raw_row(&[Some("g1"), None]),
            ],
            None,
            Some("page-2"),
        )
        .page(
            &["galaxy_id", "mass"],
            vec![raw_row(&[Some("g1"), Some("3.5")])],
            None,
            None,
        );
    let executor = QueryExecutor::new(service, settings(300));

    let result = executor.execute(&request(), None).await.expect("query");

    // 5 rows delivered, one header per page
    assert_eq!(result.len(), 3);
    assert_eq!(result.columns(), ["col0", "col1"]);
    assert_eq!(result.rows()[1].get("col1"), None);
    assert_eq!(result.rows()[2].get("col1"), Some("3.5"));
    assert_eq!(
        executor.service().fetch_tokens(),
        vec![None, Some("page-2".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_submit_makes_no_remote_calls() {
    let (token, handle) = CancellationToken::new();
    handle.cancel();
    let executor = QueryExecutor::new(ScriptedQueryService::new(), settings(300));

    let err = executor
        .execute(&request(), Some(&token.listener()))
        .await
        .expect_err("cancelled");

    assert!(matches!(
        err,
        CosmosError::Query(QueryError::Cancelled { execution_id: None })
    ));
    assert!(executor.service().untouched());
}

#[tokio::test(start_paused = true)]
async fn cancel_while_polling_stops_remote_query() {
    let (token, handle) = CancellationToken::new();
    let listener = token.listener();
    let service = ScriptedQueryService::new()
        .submit_ok("q-7")
        .then_always(ExecutionState::Running);
    let executor = QueryExecutor::new(service, settings(300));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.cancel();
    });

    let err = executor
        .execute(&request(), Some(&listener))
        .await
        .expect_err("cancelled");

    match err {
        CosmosError::Query(QueryError::Cancelled {
            execution_id: Some(id),
        }) => assert_eq!(id.as_str(), "q-7"),
        other => panic!("unexpected error variant {other:?}"),
    }
    assert_eq!(executor.service().stop_calls(), 1);
    assert_eq!(executor.service().status_checks(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_status_errors_are_retried() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status_err(ServiceError::Unavailable {
            status: 503,
            url: "http://gateway/".into(),
            body: "maintenance".into(),
        })
        .status_err(ServiceError::Throttled {
            url: "http://gateway/".into(),
            retry_after: Some(Duration::from_secs(2)),
        })
        .status(ExecutionState::Succeeded);
    let executor = QueryExecutor::new(service, settings(300));

    let result = executor.execute(&request(), None).await.expect("query");

    assert!(result.is_empty());
    assert_eq!(executor.service().status_checks(), 3);
}

#[tokio::test(start_paused = true)]
async fn huge_retry_after_cannot_outlast_timeout() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status_err(throttled(Some(Duration::from_secs(3_600))))
        .then_always(ExecutionState::Running);
    let settings = settings(5);
    let bound = settings.timeout + settings.poll_interval;
    let executor = QueryExecutor::new(service, settings);

    let started = Instant::now();
    let err = executor.execute(&request(), None).await.expect_err("timeout");
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "{err:?}");
    assert!(elapsed <= bound, "elapsed {elapsed:?} > {bound:?}");
    // hint capped at the 1s max backoff, then polls at t=1..=6s
    assert_eq!(executor.service().status_checks(), 7);
}

#[tokio::test(start_paused = true)]
async fn retry_sleeps_stop_at_poll_deadline() {
    let mut service = ScriptedQueryService::new().submit_ok("q-1");
    for _ in 0..10 {
        service = service.status_err(throttled(None));
    }
    let mut settings = settings(5);
    settings.retry = RetryConfig {
        max_attempts: 10,
        initial_backoff_ms: 3_600_000,
        max_backoff_ms: 3_600_000,
        jitter: false,
    };
    let bound = settings.timeout + settings.poll_interval;
    let executor = QueryExecutor::new(service, settings);

    let started = Instant::now();
    let err = executor.execute(&request(), None).await.expect_err("timeout");
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(err.to_string(), "Query timeout after 5s");
    assert!(elapsed <= bound, "elapsed {elapsed:?} > {bound:?}");
    // one attempt at t=0 and one when the clamped sleep ends at the deadline
    assert_eq!(executor.service().status_checks(), 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_status_check_is_cut_off_at_timeout() {
    let executor = QueryExecutor::new(UnresponsiveStatus, settings(5));

    let started = Instant::now();
    let err = executor.execute(&request(), None).await.expect_err("timeout");
    let elapsed = started.elapsed();

    match err {
        CosmosError::Query(QueryError::Timeout { execution_id, .. }) => {
            assert_eq!(execution_id.as_str(), "q-hung");
        }
        other => panic!("unexpected error variant {other:?}"),
    }
    assert!(elapsed <= Duration::from_secs(6), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_as_execution_error() {
    let unavailable = || ServiceError::Unavailable {
        status: 502,
        url: "http://gateway/".into(),
        body: "bad gateway".into(),
    };
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status(ExecutionState::Succeeded)
        .page_err(unavailable())
        .page_err(unavailable())
        .page_err(unavailable());
    let executor = QueryExecutor::new(service, settings(300));

    let err = executor.execute(&request(), None).await.expect_err("fetch");

    assert!(
        err.to_string().starts_with("Query execution failed:"),
        "{err}"
    );
    assert_eq!(executor.service().fetch_tokens().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_submission_is_not_retried() {
    let service = ScriptedQueryService::new().submit_err(ServiceError::InvalidRequest {
        status: 400,
        kind: Some("InvalidRequestException".into()),
        message: "line 1:8: mismatched input".into(),
        url: "http://gateway/".into(),
    });
    let executor = QueryExecutor::new(service, settings(300));

    let err = executor.execute(&request(), None).await.expect_err("submit");

    assert!(matches!(
        err,
        CosmosError::Query(QueryError::Submission { .. })
    ));
    assert_eq!(executor.service().submission_count(), 1);
    assert_eq!(executor.service().status_checks(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_stays_authentication_error() {
    let service = ScriptedQueryService::new()
        .submit_ok("q-1")
        .status_err(ServiceError::Unauthorized {
            status: 403,
            url: "http://gateway/".into(),
        });
    let executor = QueryExecutor::new(service, settings(300));

    let err = executor.execute(&request(), None).await.expect_err("auth");

    assert!(err.is_authentication(), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn retried_submission_reuses_request_token() {
    let service = ScriptedQueryService::new()
        .submit_err(ServiceError::Transport {
            message: "connection reset".into(),
            url: "http://gateway/".into(),
            is_timeout: false,
        })
        .submit_ok("q-2")
        .status(ExecutionState::Succeeded);
    let executor = QueryExecutor::new(service, settings(300));

    executor.execute(&request(), None).await.expect("query");

    let submitted = executor.service().submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(
        submitted[0].client_request_token,
        submitted[1].client_request_token
    );
}
