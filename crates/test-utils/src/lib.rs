//! Shared scaffolding for cosmos-genesis tests.
//!
//! [`ScriptedQueryService`] replays queued responses instead of talking to the network, and
//! records every call so tests can assert on what the executor asked for.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use cosmos_genesis::{
    ExecutionId, ExecutionState, ExecutionStatus, QueryService, RawRow, ResultPage, ServiceError,
    StartQuery,
};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a stderr subscriber for tests. Safe to call from every test.
pub fn init_tracing_tests(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper_util=error,reqwest=warn")));

    let console = fmt::layer()
        .with_target(true)
        .with_level(true)
        .without_time()
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer();

    // another test may already have installed one
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init();
}

/// Build a raw row from optional string cells.
pub fn raw_row(cells: &[Option<&str>]) -> RawRow {
    cells.iter().map(|c| c.map(str::to_string)).collect()
}

/// In-memory [`QueryService`] that answers from per-operation scripts.
///
/// When a script runs dry the service falls back to a benign answer: a fixed execution id,
/// the configured fallback status (`RUNNING` unless changed), an empty last page, and a
/// successful stop.
#[derive(Debug)]
pub struct ScriptedQueryService {
    submissions: Mutex<VecDeque<Result<ExecutionId, ServiceError>>>,
    statuses: Mutex<VecDeque<Result<ExecutionStatus, ServiceError>>>,
    fallback_status: ExecutionState,
    pages: Mutex<VecDeque<Result<ResultPage, ServiceError>>>,
    stops: Mutex<VecDeque<Result<(), ServiceError>>>,

    submitted: Mutex<Vec<StartQuery>>,
    fetch_tokens: Mutex<Vec<Option<String>>>,
    status_checks: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl Default for ScriptedQueryService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedQueryService {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            fallback_status: ExecutionState::Running,
            pages: Mutex::new(VecDeque::new()),
            stops: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            fetch_tokens: Mutex::new(Vec::new()),
            status_checks: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn submit_ok(self, id: &str) -> Self {
        push(&self.submissions, Ok(ExecutionId::new(id)));
        self
    }

    pub fn submit_err(self, err: ServiceError) -> Self {
        push(&self.submissions, Err(err));
        self
    }

    pub fn status(self, state: ExecutionState) -> Self {
        push(&self.statuses, Ok(ExecutionStatus::new(state)));
        self
    }

    pub fn status_with_reason(self, state: ExecutionState, reason: &str) -> Self {
        push(
            &self.statuses,
            Ok(ExecutionStatus::new(state).with_reason(reason)),
        );
        self
    }

    pub fn status_err(self, err: ServiceError) -> Self {
        push(&self.statuses, Err(err));
        self
    }

    /// State reported once the status script is exhausted.
    pub fn then_always(mut self, state: ExecutionState) -> Self {
        self.fallback_status = state;
        self
    }

    /// Queue a results page. `header` becomes the page's first row.
    pub fn page(
        self,
        header: &[&str],
        rows: Vec<RawRow>,
        column_names: Option<&[&str]>,
        next_token: Option<&str>,
    ) -> Self {
        let mut all = Vec::with_capacity(rows.len() + 1);
        all.push(header.iter().map(|h| Some(h.to_string())).collect());
        all.extend(rows);
        push(
            &self.pages,
            Ok(ResultPage {
                rows: all,
                column_names: column_names
                    .map(|names| names.iter().map(|n| n.to_string()).collect()),
                next_token: next_token.map(str::to_string),
            }),
        );
        self
    }

    pub fn page_err(self, err: ServiceError) -> Self {
        push(&self.pages, Err(err));
        self
    }

    pub fn stop_err(self, err: ServiceError) -> Self {
        push(&self.stops, Err(err));
        self
    }

    pub fn submitted(&self) -> Vec<StartQuery> {
        lock(&self.submitted).clone()
    }

    pub fn submission_count(&self) -> usize {
        lock(&self.submitted).len()
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Page tokens passed to each fetch, in call order.
    pub fn fetch_tokens(&self) -> Vec<Option<String>> {
        lock(&self.fetch_tokens).clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// True if the service saw no calls at all.
    pub fn untouched(&self) -> bool {
        self.submission_count() == 0
            && self.status_checks() == 0
            && self.fetch_tokens().is_empty()
            && self.stop_calls() == 0
    }
}

impl QueryService for ScriptedQueryService {
    async fn start_query(&self, request: &StartQuery) -> Result<ExecutionId, ServiceError> {
        lock(&self.submitted).push(request.clone());
        pop(&self.submissions).unwrap_or_else(|| Ok(ExecutionId::new("q-scripted")))
    }

    async fn execution_status(&self, _id: &ExecutionId) -> Result<ExecutionStatus, ServiceError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        pop(&self.statuses).unwrap_or_else(|| Ok(ExecutionStatus::new(self.fallback_status)))
    }

    async fn fetch_results(
        &self,
        _id: &ExecutionId,
        next_token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        lock(&self.fetch_tokens).push(next_token.map(str::to_string));
        pop(&self.pages).unwrap_or_else(|| Ok(ResultPage::default()))
    }

    async fn stop_query(&self, _id: &ExecutionId) -> Result<(), ServiceError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        pop(&self.stops).unwrap_or(Ok(()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn push<T>(queue: &Mutex<VecDeque<T>>, item: T) {
    lock(queue).push_back(item);
}

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    lock(queue).pop_front()
}
