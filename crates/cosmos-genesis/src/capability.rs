//! Optional and not-yet-implemented parts of the public surface.
//!
//! Instead of silently doing nothing, each of these is a [`Capability`] whose
//! [`Availability`] can be checked up front. Calling into one that is unavailable returns
//! [`CosmosError::NotSupported`] or [`CosmosError::MissingCapability`].

use std::fmt;

use crate::error::CosmosError;
#[cfg(feature = "frame")]
use crate::error::QueryError;
use crate::result::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Fetching schema definitions by name.
    SchemaLookup,
    /// A natively asynchronous client surface.
    AsyncClient,
    /// Converting query results into a columnar frame.
    TabularFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    NotSupported,
    MissingDependency {
        dependency: &'static str,
        feature: &'static str,
    },
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::SchemaLookup,
        Capability::AsyncClient,
        Capability::TabularFrame,
    ];

    pub fn availability(self) -> Availability {
        match self {
            Capability::SchemaLookup | Capability::AsyncClient => Availability::NotSupported,
            Capability::TabularFrame => {
                if cfg!(feature = "frame") {
                    Availability::Available
                } else {
                    Availability::MissingDependency {
                        dependency: "arrow",
                        feature: "frame",
                    }
                }
            }
        }
    }

    pub fn is_available(self) -> bool {
        self.availability() == Availability::Available
    }

    /// `Ok(())` when usable, otherwise the error a call into this capability would return.
    pub fn ensure_available(self) -> Result<(), CosmosError> {
        match self.availability() {
            Availability::Available => Ok(()),
            Availability::NotSupported => Err(CosmosError::NotSupported(self)),
            Availability::MissingDependency {
                dependency,
                feature,
            } => Err(CosmosError::MissingCapability {
                capability: self,
                dependency,
                feature,
            }),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::SchemaLookup => "schema lookup",
            Capability::AsyncClient => "async client",
            Capability::TabularFrame => "tabular frame conversion",
        })
    }
}

/// Columnar view of a [`QueryResult`]: an Arrow `RecordBatch` of nullable UTF-8 columns.
#[cfg(feature = "frame")]
pub type Frame = arrow::record_batch::RecordBatch;

/// Uninhabited stand-in so the frame API keeps the same shape without the `frame` feature.
#[cfg(not(feature = "frame"))]
#[derive(Debug)]
pub enum Frame {}

#[cfg(feature = "frame")]
pub fn to_frame(result: &QueryResult) -> Result<Frame, CosmosError> {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    let columns = result.columns();
    if columns.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let schema = Schema::new(
        columns
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    );
    let arrays: Vec<ArrayRef> = (0..columns.len())
        .map(|idx| {
            let values: StringArray = result.rows().iter().map(|row| row.value_at(idx)).collect();
            Arc::new(values) as ArrayRef
        })
        .collect();

    RecordBatch::try_new(Arc::new(schema), arrays).map_err(frame_error)
}

/// Arrow rejecting the assembled columns is a result problem, not a configuration one.
#[cfg(feature = "frame")]
fn frame_error(e: arrow::error::ArrowError) -> CosmosError {
    QueryError::Execution {
        message: format!("failed to assemble frame: {e}"),
    }
    .into()
}

#[cfg(not(feature = "frame"))]
pub fn to_frame(_result: &QueryResult) -> Result<Frame, CosmosError> {
    Err(match Capability::TabularFrame.ensure_available() {
        Err(e) => e,
        Ok(()) => CosmosError::NotSupported(Capability::TabularFrame),
    })
}
