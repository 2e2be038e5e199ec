//! The external query service the executor drives.
//!
//! [`QueryService`] is the seam between the executor's state machine and whatever actually
//! runs the SQL. [`http::HttpQueryService`] talks to the hosted gateway; tests script their own.

pub mod http;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::RawRow;

pub use http::HttpQueryService;

/// Opaque handle for one submitted query.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionId").field(&self.0).finish()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Any state this client does not know; treated as still in flight.
    #[serde(other)]
    Unknown,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
            ExecutionState::Unknown => "UNKNOWN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    /// Service-provided explanation, usually only set for `FAILED`/`CANCELLED`.
    pub reason: Option<String>,
}

impl ExecutionStatus {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Everything the service needs to start one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartQuery {
    pub sql: String,
    pub database: String,
    pub output_location: String,
    /// Idempotency token; resubmitting with the same token does not start a second execution.
    pub client_request_token: String,
}

/// One page of raw results. The first row of every page is a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPage {
    pub rows: Vec<RawRow>,
    /// Column names from result metadata, when the service reports them.
    pub column_names: Option<Vec<String>>,
    pub next_token: Option<String>,
}

/// Operations consumed from the external query service.
pub trait QueryService: Send + Sync {
    fn start_query(
        &self,
        request: &StartQuery,
    ) -> impl Future<Output = Result<ExecutionId, ServiceError>> + Send;

    fn execution_status(
        &self,
        id: &ExecutionId,
    ) -> impl Future<Output = Result<ExecutionStatus, ServiceError>> + Send;

    fn fetch_results(
        &self,
        id: &ExecutionId,
        next_token: Option<&str>,
    ) -> impl Future<Output = Result<ResultPage, ServiceError>> + Send;

    fn stop_query(&self, id: &ExecutionId)
    -> impl Future<Output = Result<(), ServiceError>> + Send;
}

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("credential rejected (status {status}, url={url})")]
    Unauthorized { status: u16, url: String },

    #[error("throttled by query service (url={url}, retry_after={retry_after:?})")]
    Throttled {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("query service unavailable (status {status}, url={url}): {body}")]
    Unavailable { status: u16, url: String, body: String },

    #[error("invalid request (status {status}, kind={kind:?}, url={url}): {message}")]
    InvalidRequest {
        status: u16,
        kind: Option<String>,
        message: String,
        url: String,
    },

    #[error("unexpected status {status} from query service (url={url}): {body}")]
    Unexpected { status: u16, url: String, body: String },

    #[error("transport error (url={url}): {message}")]
    Transport {
        message: String,
        url: String,
        is_timeout: bool,
    },

    #[error("failed to serialize request: {0}")]
    Serialization(String),

    #[error("error decoding response (status {status}, url={url}): {message}; body_snippet={body_snippet}")]
    Decode {
        message: String,
        status: u16,
        url: String,
        body_snippet: String,
    },
}

impl ServiceError {
    /// Worth another attempt with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Throttled { .. }
                | ServiceError::Unavailable { .. }
                | ServiceError::Transport { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_known_and_unknown_states() {
        let state: ExecutionState = serde_json::from_str("\"SUCCEEDED\"").unwrap();
        assert_eq!(state, ExecutionState::Succeeded);
        let state: ExecutionState = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(state, ExecutionState::Cancelled);
        let state: ExecutionState = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(state, ExecutionState::Unknown);
        assert!(!state.is_terminal());
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Succeeded.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Queued.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
    }

    #[test]
    fn only_transport_level_failures_are_transient() {
        let url = "http://localhost/".to_string();
        assert!(
            ServiceError::Throttled {
                url: url.clone(),
                retry_after: None
            }
            .is_transient()
        );
        assert!(
            ServiceError::Unavailable {
                status: 503,
                url: url.clone(),
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ServiceError::Unauthorized {
                status: 401,
                url: url.clone()
            }
            .is_transient()
        );
        assert!(
            !ServiceError::InvalidRequest {
                status: 400,
                kind: None,
                message: "bad".into(),
                url
            }
            .is_transient()
        );
    }
}
