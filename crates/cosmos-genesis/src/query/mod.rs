//! SQL text produced and rewritten on the client side.

pub mod builder;
pub mod rewrite;

pub use builder::{BuildError, QueryBuilder, SortDirection};
pub use rewrite::{
    PARTITION_COLUMN, PartitionFilter, PredicateInjector, TextualInjector, UNIVERSE_TIME_COLUMN,
    inject_partition_filter,
};
