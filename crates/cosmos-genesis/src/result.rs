use std::sync::Arc;

use itertools::Itertools;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// A row as delivered by the query service: fixed-width, string-or-null cells.
pub type RawRow = Vec<Option<String>>;

/// Rows returned by one execution, with the column names shared by every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    columns: Arc<[String]>,
    rows: Vec<Record>,
}

/// One result row keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl QueryResult {
    /// Map raw rows to records.
    ///
    /// Column names reported by the service are used when they line up with the row width and
    /// are unique; otherwise rows are keyed by positional aliases `col0`, `col1`, ...
    pub fn from_rows(column_names: Option<Vec<String>>, rows: Vec<RawRow>) -> Self {
        let Some(width) = rows.first().map(Vec::len) else {
            return Self::default();
        };
        let columns: Arc<[String]> = match column_names {
            Some(names) if names.len() == width && names.iter().all_unique() => names.into(),
            _ => positional_aliases(width).into(),
        };
        let rows = rows
            .into_iter()
            .map(|mut values| {
                values.truncate(width);
                Record {
                    columns: Arc::clone(&columns),
                    values,
                }
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}

impl IntoIterator for QueryResult {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl Record {
    /// Value of `column`; `None` when the column is unknown or the cell is null.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.value_at(idx)
    }

    /// Whether `column` exists for this record, regardless of its value.
    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn value_at(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Column/value pairs in column order. Short rows yield only the cells they carry.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of pairs [`Self::iter`] yields.
    fn entry_count(&self) -> usize {
        self.columns.len().min(self.values.len())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entry_count()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, &value)?;
        }
        map.end()
    }
}

impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.iter())
    }
}

pub(crate) fn positional_aliases(width: usize) -> Vec<String> {
    (0..width).map(|i| format!("col{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[Option<&str>]) -> RawRow {
        cells.iter().map(|c| c.map(str::to_string)).collect()
    }

    #[test]
    fn empty_rows_produce_empty_result() {
        let result = QueryResult::from_rows(Some(vec!["a".into()]), Vec::new());
        assert!(result.is_empty());
        assert!(result.columns().is_empty());
    }

    #[test]
    fn falls_back_to_positional_aliases_without_metadata() {
        let result = QueryResult::from_rows(
            None,
            vec![row(&[Some("sys-1"), Some("12.5")]), row(&[Some("sys-2"), None])],
        );
        assert_eq!(result.columns(), ["col0", "col1"]);
        assert_eq!(result.rows()[0].get("col0"), Some("sys-1"));
        assert_eq!(result.rows()[1].get("col1"), None);
        assert!(result.rows()[1].contains("col1"));
    }

    #[test]
    fn prefers_service_column_names() {
        let result = QueryResult::from_rows(
            Some(vec!["system_id".into(), "stellar_mass_msun".into()]),
            vec![row(&[Some("sys-1"), Some("12.5")])],
        );
        assert_eq!(result.rows()[0].get("stellar_mass_msun"), Some("12.5"));
        assert_eq!(result.rows()[0].get("col1"), None);
    }

    #[test]
    fn mismatched_or_duplicate_names_fall_back() {
        let width_mismatch = QueryResult::from_rows(
            Some(vec!["only_one".into()]),
            vec![row(&[Some("a"), Some("b")])],
        );
        assert_eq!(width_mismatch.columns(), ["col0", "col1"]);

        let duplicates = QueryResult::from_rows(
            Some(vec!["mass".into(), "mass".into()]),
            vec![row(&[Some("1"), Some("2")])],
        );
        assert_eq!(duplicates.columns(), ["col0", "col1"]);
    }

    #[test]
    fn wider_rows_are_cut_to_first_row_width() {
        let result = QueryResult::from_rows(
            None,
            vec![row(&[Some("a")]), row(&[Some("b"), Some("extra")])],
        );
        assert_eq!(result.rows()[1].len(), 1);
        assert_eq!(result.rows()[1].get("col0"), Some("b"));
    }

    #[test]
    fn short_row_serializes_only_present_cells() {
        let result = QueryResult::from_rows(
            None,
            vec![row(&[Some("a"), Some("b"), None]), row(&[Some("c")])],
        );
        let short = &result.rows()[1];
        assert_eq!(short.entry_count(), 1);
        assert_eq!(short.entry_count(), short.iter().count());
        let json = serde_json::to_value(short).expect("serialize");
        assert_eq!(json, serde_json::json!({"col0": "c"}));

        let full = &result.rows()[0];
        assert_eq!(full.entry_count(), full.iter().count());
    }

    #[test]
    fn serializes_records_as_ordered_maps() {
        let result = QueryResult::from_rows(
            Some(vec!["galaxy_id".into(), "system_count".into()]),
            vec![row(&[Some("spiral-sm-2arm-001"), None])],
        );
        let json = serde_json::to_string(&result).expect("serialize");
        assert_eq!(
            json,
            r#"[{"galaxy_id":"spiral-sm-2arm-001","system_count":null}]"#
        );
    }
}
