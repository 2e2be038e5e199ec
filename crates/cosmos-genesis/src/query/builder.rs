use std::fmt;

use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("SELECT fields required")]
    MissingFields,
    #[error("FROM table required")]
    MissingTable,
}

/// Builds a single `SELECT` statement from chained calls.
///
/// ```
/// use cosmos_genesis::QueryBuilder;
///
/// let sql = QueryBuilder::new()
///     .select(["system_id", "stellar_mass_msun"])
///     .from_table("star")
///     .and_where("spectral_type = 'O'")
///     .limit(100)
///     .build()
///     .unwrap();
/// assert_eq!(
///     sql,
///     "SELECT system_id, stellar_mass_msun FROM star WHERE spectral_type = 'O' LIMIT 100"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBuilder {
    fields: Vec<String>,
    table: Option<String>,
    conditions: Vec<String>,
    order_by: Option<(String, SortDirection)>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append fields to the selection, in order. Duplicates are kept.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn from_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Add a raw condition. Conditions are joined with `AND` in call order.
    pub fn and_where(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Order ascending by `field`, replacing any earlier ordering.
    pub fn order_by(self, field: impl Into<String>) -> Self {
        self.order_by_dir(field, SortDirection::Asc)
    }

    pub fn order_by_dir(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, count: i64) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn offset(mut self, count: i64) -> Self {
        self.offset = Some(count);
        self
    }

    /// Render the statement. Fails if no fields were selected or no table was set.
    pub fn build(&self) -> Result<String, BuildError> {
        if self.fields.is_empty() {
            return Err(BuildError::MissingFields);
        }
        let table = self.table.as_deref().ok_or(BuildError::MissingTable)?;

        let mut parts = vec![
            format!("SELECT {}", self.fields.iter().join(", ")),
            format!("FROM {table}"),
        ];
        if !self.conditions.is_empty() {
            parts.push(format!("WHERE {}", self.conditions.iter().join(" AND ")));
        }
        if let Some((field, direction)) = &self.order_by {
            parts.push(format!("ORDER BY {field} {direction}"));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("OFFSET {offset}"));
        }
        Ok(parts.join(" "))
    }
}

impl TryFrom<&QueryBuilder> for String {
    type Error = BuildError;

    fn try_from(builder: &QueryBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl TryFrom<QueryBuilder> for String {
    type Error = BuildError;

    fn try_from(builder: QueryBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}
