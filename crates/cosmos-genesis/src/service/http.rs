//! [`QueryService`] over the hosted Athena-compatible JSON gateway.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    ExecutionId, ExecutionState, ExecutionStatus, QueryService, ResultPage, ServiceError,
    StartQuery,
};
use crate::config::{
    ApiKey, ClientConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::error::{CosmosError, truncate_for_error};
use crate::result::RawRow;

const TARGET_PREFIX: &str = "AmazonAthena";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const BODY_SNIPPET_MAX: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    StartQueryExecution,
    GetQueryExecution,
    GetQueryResults,
    StopQueryExecution,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::StartQueryExecution => "StartQueryExecution",
            Action::GetQueryExecution => "GetQueryExecution",
            Action::GetQueryResults => "GetQueryResults",
            Action::StopQueryExecution => "StopQueryExecution",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpQueryService {
    client: reqwest::Client,
    endpoint: Url,
    api_key: ApiKey,
    page_size: Option<u32>,
}

impl HttpQueryService {
    /// A service with the default request and connect timeouts.
    pub fn new(endpoint: Url, api_key: ApiKey) -> Result<Self, CosmosError> {
        let client = build_client(
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        )?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            page_size: None,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, CosmosError> {
        let client = build_client(config.request_timeout(), config.connect_timeout())?;
        Ok(Self {
            client,
            endpoint: config.endpoint().clone(),
            api_key: config.api_key().clone(),
            page_size: config.page_size(),
        })
    }

    /// Use a preconfigured client, e.g. one with proxy or TLS settings.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<Req, Resp>(&self, action: Action, input: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint.as_str();
        // Serialized by hand so the amz-json content type is not replaced by `.json()`.
        let body =
            serde_json::to_vec(input).map_err(|e| ServiceError::Serialization(e.to_string()))?;

        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.api_key.expose())
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{}", action.as_str()))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(&e, url))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(from_status(status, &body, url, retry_after));
        }

        let bytes = resp.bytes().await.map_err(|e| transport_error(&e, url))?;
        serde_json::from_slice::<Resp>(&bytes).map_err(|e| ServiceError::Decode {
            message: e.to_string(),
            status: status.as_u16(),
            url: url.to_string(),
            body_snippet: truncate_for_error(&String::from_utf8_lossy(&bytes), BODY_SNIPPET_MAX),
        })
    }
}

impl QueryService for HttpQueryService {
    #[tracing::instrument(skip_all, target = "cosmos-query", fields(database = %request.database))]
    async fn start_query(&self, request: &StartQuery) -> Result<ExecutionId, ServiceError> {
        let input = StartQueryExecutionInput {
            query_string: &request.sql,
            query_execution_context: QueryExecutionContext {
                database: &request.database,
            },
            result_configuration: ResultConfiguration {
                output_location: &request.output_location,
            },
            client_request_token: &request.client_request_token,
        };
        let out: StartQueryExecutionOutput =
            self.call(Action::StartQueryExecution, &input).await?;
        Ok(ExecutionId::new(out.query_execution_id))
    }

    async fn execution_status(&self, id: &ExecutionId) -> Result<ExecutionStatus, ServiceError> {
        let input = ExecutionIdInput {
            query_execution_id: id.as_str(),
        };
        let out: GetQueryExecutionOutput = self.call(Action::GetQueryExecution, &input).await?;
        let status = out.query_execution.status;
        Ok(ExecutionStatus {
            state: status.state,
            reason: status.state_change_reason,
        })
    }

    async fn fetch_results(
        &self,
        id: &ExecutionId,
        next_token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        let input = GetQueryResultsInput {
            query_execution_id: id.as_str(),
            next_token,
            max_results: self.page_size,
        };
        let out: GetQueryResultsOutput = self.call(Action::GetQueryResults, &input).await?;
        Ok(out.into_page())
    }

    async fn stop_query(&self, id: &ExecutionId) -> Result<(), ServiceError> {
        let input = ExecutionIdInput {
            query_execution_id: id.as_str(),
        };
        let _: serde_json::Value = self.call(Action::StopQueryExecution, &input).await?;
        Ok(())
    }
}

/// Every call is bounded, so a gateway that stops responding surfaces as a transport timeout.
fn build_client(
    timeout: Duration,
    connect_timeout: Duration,
) -> Result<reqwest::Client, CosmosError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| CosmosError::Config(format!("failed to build HTTP client: {e}")))
}

fn transport_error(e: &reqwest::Error, url: &str) -> ServiceError {
    ServiceError::Transport {
        message: e.to_string(),
        url: url.to_string(),
        is_timeout: e.is_timeout(),
    }
}

/// Map a non-success response to a [`ServiceError`].
fn from_status(
    status: StatusCode,
    body: &str,
    url: &str,
    retry_after: Option<Duration>,
) -> ServiceError {
    let url = url.to_string();
    let code = status.as_u16();
    match code {
        401 | 403 => ServiceError::Unauthorized { status: code, url },
        429 => ServiceError::Throttled { url, retry_after },
        400..=499 => {
            let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
            let kind = envelope
                .as_ref()
                .and_then(ErrorEnvelope::kind)
                .map(str::to_string);
            if kind.as_deref().is_some_and(is_throttling_kind) {
                return ServiceError::Throttled { url, retry_after };
            }
            let message = envelope
                .and_then(|e| e.message)
                .unwrap_or_else(|| truncate_for_error(body, BODY_SNIPPET_MAX));
            ServiceError::InvalidRequest {
                status: code,
                kind,
                message,
                url,
            }
        }
        500..=599 => ServiceError::Unavailable {
            status: code,
            url,
            body: truncate_for_error(body, BODY_SNIPPET_MAX),
        },
        _ => ServiceError::Unexpected {
            status: code,
            url,
            body: truncate_for_error(body, BODY_SNIPPET_MAX),
        },
    }
}

fn is_throttling_kind(kind: &str) -> bool {
    matches!(kind, "ThrottlingException" | "TooManyRequestsException")
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl ErrorEnvelope {
    /// `com.amazonaws.athena#InvalidRequestException` -> `InvalidRequestException`
    fn kind(&self) -> Option<&str> {
        self.kind
            .as_deref()
            .map(|k| k.rsplit_once('#').map_or(k, |(_, short)| short))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartQueryExecutionInput<'a> {
    query_string: &'a str,
    query_execution_context: QueryExecutionContext<'a>,
    result_configuration: ResultConfiguration<'a>,
    client_request_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueryExecutionContext<'a> {
    database: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResultConfiguration<'a> {
    output_location: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartQueryExecutionOutput {
    query_execution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecutionIdInput<'a> {
    query_execution_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryExecutionOutput {
    query_execution: QueryExecutionWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryExecutionWire {
    status: StatusWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusWire {
    state: ExecutionState,
    #[serde(default)]
    state_change_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryResultsInput<'a> {
    query_execution_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryResultsOutput {
    result_set: ResultSetWire,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultSetWire {
    #[serde(default)]
    rows: Vec<RowWire>,
    #[serde(default)]
    result_set_metadata: Option<ResultSetMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RowWire {
    #[serde(default)]
    data: Vec<DatumWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DatumWire {
    #[serde(default)]
    var_char_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultSetMetadata {
    #[serde(default)]
    column_info: Vec<ColumnInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ColumnInfo {
    name: String,
}

impl GetQueryResultsOutput {
    fn into_page(self) -> ResultPage {
        let rows: Vec<RawRow> = self
            .result_set
            .rows
            .into_iter()
            .map(|row| row.data.into_iter().map(|d| d.var_char_value).collect())
            .collect();
        let column_names = self
            .result_set
            .result_set_metadata
            .map(|m| m.column_info.into_iter().map(|c| c.name).collect::<Vec<_>>())
            .filter(|names| !names.is_empty());
        ResultPage {
            rows,
            column_names,
            next_token: self.next_token.filter(|t| !t.is_empty()),
        }
    }
}
