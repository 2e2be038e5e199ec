//! Client for querying Cosmos Genesis universe simulation data.
//!
//! Queries are plain SQL against tables partitioned by galaxy. Every query is pinned to one
//! galaxy: the client injects the `galaxy_id` predicate (and an optional `universe_time` filter)
//! before submitting, then polls the hosted query service until the execution finishes and
//! returns the rows as [`QueryResult`].
//!
//! ```no_run
//! use cosmos_genesis::{ClientOptions, CosmosClient, QueryBuilder};
//!
//! # fn main() -> Result<(), cosmos_genesis::CosmosError> {
//! let client = CosmosClient::new(ClientOptions::default().with_api_key("..."))?;
//! let sql = QueryBuilder::new()
//!     .select(["system_id", "stellar_mass_msun"])
//!     .from_table("star")
//!     .limit(10)
//!     .build()?;
//! for row in &client.query_galaxy("spiral-sm-2arm-001", &sql, 0)? {
//!     println!("{:?}", row.get("system_id"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel_token;
pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod query;
pub mod result;
pub mod service;

pub use cancel_token::{CancellationHandle, CancellationListener, CancellationToken};
pub use capability::{Availability, Capability, Frame};
pub use client::{AsyncCosmosClient, CosmosClient, GalaxySummary};
pub use crate::config::{API_KEY_ENV, ApiKey, ClientConfig, ClientOptions, RetryConfig};
pub use error::{CosmosError, QueryError};
pub use executor::{ExecutionRequest, ExecutorSettings, QueryExecutor};
pub use query::{
    BuildError, PartitionFilter, PredicateInjector, QueryBuilder, SortDirection, TextualInjector,
    inject_partition_filter,
};
pub use result::{QueryResult, RawRow, Record};
pub use service::{
    ExecutionId, ExecutionState, ExecutionStatus, HttpQueryService, QueryService, ResultPage,
    ServiceError, StartQuery,
};
