use std::time::Duration;

use thiserror::Error;

use crate::capability::Capability;
use crate::query::BuildError;
use crate::service::{ExecutionId, ExecutionState, ServiceError};

/// Base error for everything the client surfaces to callers.
#[derive(Debug, Error)]
pub enum CosmosError {
    /// Missing credential at construction, or a credential rejected by the query service.
    #[error("{0}")]
    Authentication(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// Reserved for schema lookup, which is not implemented yet.
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("{0} is not supported yet")]
    NotSupported(Capability),

    #[error(
        "{capability} requires the `{dependency}` dependency. Rebuild with the `{feature}` feature enabled"
    )]
    MissingCapability {
        capability: Capability,
        dependency: &'static str,
        feature: &'static str,
    },

    /// Caller-supplied input failed validation, e.g. an incomplete query builder.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CosmosError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, CosmosError::Authentication(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CosmosError::Query(QueryError::Timeout { .. }))
    }

    pub fn missing_credential() -> Self {
        CosmosError::Authentication(format!(
            "API key required. Pass api_key parameter or set {} environment variable.",
            crate::config::API_KEY_ENV
        ))
    }
}

impl From<BuildError> for CosmosError {
    fn from(e: BuildError) -> Self {
        CosmosError::InvalidArgument(e.to_string())
    }
}

impl From<config::ConfigError> for CosmosError {
    fn from(e: config::ConfigError) -> Self {
        CosmosError::Config(e.to_string())
    }
}

/// Failures of a single query execution.
///
/// Every variant reaches callers as [`CosmosError::Query`]; the variant only refines the message
/// and lets callers tell a timeout or cancellation apart from a remote failure.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query submission failed: {message}")]
    Submission { message: String },

    /// The service reported a terminal `FAILED` or `CANCELLED` state.
    #[error("Query failed: {reason}")]
    Failed {
        execution_id: ExecutionId,
        state: ExecutionState,
        reason: String,
    },

    #[error("Query timeout after {timeout:?}")]
    Timeout {
        execution_id: ExecutionId,
        timeout: Duration,
    },

    #[error("Query cancelled by caller{}", execution_suffix(.execution_id))]
    Cancelled { execution_id: Option<ExecutionId> },

    /// Any other failure while polling or fetching, carrying the original message.
    #[error("Query execution failed: {message}")]
    Execution { message: String },
}

/// Which step of an execution a service error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Submit,
    Poll,
    Fetch,
    Stop,
}

impl ServiceError {
    /// Translate a transport-level failure into the public taxonomy.
    ///
    /// Credential rejections stay authentication errors no matter where they happen.
    pub(crate) fn into_cosmos(self, stage: Stage) -> CosmosError {
        match self {
            ServiceError::Unauthorized { status, url } => CosmosError::Authentication(format!(
                "API key rejected by query service (status {status}, url={url})"
            )),
            other => {
                let message = other.to_string();
                match stage {
                    Stage::Submit => QueryError::Submission { message }.into(),
                    Stage::Poll | Stage::Fetch | Stage::Stop => {
                        QueryError::Execution { message }.into()
                    }
                }
            }
        }
    }
}

fn execution_suffix(id: &Option<ExecutionId>) -> String {
    id.as_ref()
        .map(|id| format!(" (execution {id})"))
        .unwrap_or_default()
}

pub(crate) fn truncate_for_error(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}
