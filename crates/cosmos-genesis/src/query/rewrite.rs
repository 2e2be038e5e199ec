//! Injection of the mandatory galaxy partition predicate into caller SQL.
//!
//! This is plain text surgery, not SQL parsing. It assumes the caller's statement does not
//! already filter on the partition column, and keyword matching is substring based (a column
//! named `somewhere` counts as a `WHERE`). Callers go through [`PredicateInjector`] so a
//! statement-level implementation can replace [`TextualInjector`] later.

pub const PARTITION_COLUMN: &str = "galaxy_id";
pub const UNIVERSE_TIME_COLUMN: &str = "universe_time";

/// Keywords that a new `WHERE` clause is placed in front of, in priority order.
const TRAILING_KEYWORDS: [&str; 3] = ["LIMIT", "ORDER BY", "GROUP BY"];

/// The partition every query is pinned to, plus an optional universe-time filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionFilter<'a> {
    galaxy_id: &'a str,
    universe_time: u64,
}

impl<'a> PartitionFilter<'a> {
    pub fn new(galaxy_id: &'a str) -> Self {
        Self {
            galaxy_id,
            universe_time: 0,
        }
    }

    /// Restrict to one universe time (Myr). `0` means unfiltered.
    pub fn at_universe_time(mut self, universe_time: u64) -> Self {
        self.universe_time = universe_time;
        self
    }

    pub fn galaxy_id(&self) -> &str {
        self.galaxy_id
    }

    pub fn universe_time(&self) -> u64 {
        self.universe_time
    }

    /// `galaxy_id = '<id>'`, followed by `AND universe_time = <t>` when a time is set.
    pub fn predicate(&self) -> String {
        let escaped = self.galaxy_id.replace('\'', "''");
        let mut predicate = format!("{PARTITION_COLUMN} = '{escaped}'");
        if self.universe_time > 0 {
            predicate.push_str(&format!(
                " AND {UNIVERSE_TIME_COLUMN} = {}",
                self.universe_time
            ));
        }
        predicate
    }
}

pub trait PredicateInjector {
    fn inject(&self, sql: &str, filter: &PartitionFilter<'_>) -> String;
}

/// Keyword-search implementation of [`PredicateInjector`].
///
/// - an existing `WHERE` gets the predicate right after it, `AND`-ed with the old condition
/// - otherwise a new `WHERE` goes before the first `LIMIT`, `ORDER BY` or `GROUP BY`,
///   checked in that order
/// - otherwise `WHERE <predicate>` is appended
///
/// Keywords match case-insensitively and keep their original spelling.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextualInjector;

impl PredicateInjector for TextualInjector {
    fn inject(&self, sql: &str, filter: &PartitionFilter<'_>) -> String {
        let predicate = filter.predicate();
        // ASCII upper-casing keeps byte offsets identical to `sql`.
        let upper = sql.to_ascii_uppercase();

        if let Some(pos) = upper.find("WHERE") {
            let (head, tail) = sql.split_at(pos + "WHERE".len());
            return format!("{head} {predicate} AND{tail}");
        }

        for keyword in TRAILING_KEYWORDS {
            if let Some(pos) = upper.find(keyword) {
                let (head, tail) = sql.split_at(pos);
                return format!("{head}WHERE {predicate} {tail}");
            }
        }

        format!("{sql} WHERE {predicate}")
    }
}

/// Rewrite `sql` with the default [`TextualInjector`].
pub fn inject_partition_filter(sql: &str, galaxy_id: &str, universe_time: u64) -> String {
    let filter = PartitionFilter::new(galaxy_id).at_universe_time(universe_time);
    TextualInjector.inject(sql, &filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_after_existing_where() {
        let out = inject_partition_filter("SELECT * FROM star WHERE mass>10", "g1", 0);
        assert_eq!(out, "SELECT * FROM star WHERE galaxy_id = 'g1' AND mass>10");
    }

    #[test]
    fn only_first_where_is_touched() {
        let sql = "SELECT * FROM star WHERE system_id IN (SELECT system_id FROM planet WHERE habitable)";
        let out = inject_partition_filter(sql, "g1", 0);
        assert_eq!(
            out,
            "SELECT * FROM star WHERE galaxy_id = 'g1' AND system_id IN (SELECT system_id FROM planet WHERE habitable)"
        );
    }

    #[test]
    fn lowercase_where_keeps_its_spelling() {
        let out = inject_partition_filter("select * from star where mass > 10", "g1", 0);
        assert_eq!(out, "select * from star where galaxy_id = 'g1' AND mass > 10");
    }

    #[test]
    fn appends_when_no_keywords_present() {
        let out = inject_partition_filter("SELECT * FROM star", "g1", 0);
        assert_eq!(out, "SELECT * FROM star WHERE galaxy_id = 'g1'");
    }

    #[test]
    fn inserts_before_limit() {
        let out = inject_partition_filter("SELECT * FROM star LIMIT 100", "spiral-sm-2arm-001", 0);
        assert_eq!(
            out,
            "SELECT * FROM star WHERE galaxy_id = 'spiral-sm-2arm-001' LIMIT 100"
        );
    }

    #[test]
    fn inserts_before_order_by_and_group_by() {
        let ordered = inject_partition_filter("SELECT * FROM star ORDER BY mass DESC", "g1", 0);
        assert_eq!(
            ordered,
            "SELECT * FROM star WHERE galaxy_id = 'g1' ORDER BY mass DESC"
        );

        let grouped = inject_partition_filter(
            "SELECT spectral_type, COUNT(*) FROM star GROUP BY spectral_type",
            "g1",
            0,
        );
        assert_eq!(
            grouped,
            "SELECT spectral_type, COUNT(*) FROM star WHERE galaxy_id = 'g1' GROUP BY spectral_type"
        );
    }

    #[test]
    fn limit_takes_priority_over_earlier_order_by() {
        // keyword priority, not position
        let out = inject_partition_filter("SELECT * FROM star ORDER BY mass LIMIT 5", "g1", 0);
        assert_eq!(
            out,
            "SELECT * FROM star ORDER BY mass WHERE galaxy_id = 'g1' LIMIT 5"
        );
    }

    #[test]
    fn universe_time_follows_partition_predicate_once() {
        let out = inject_partition_filter("SELECT * FROM star WHERE mass>10", "g1", 4200);
        assert_eq!(
            out,
            "SELECT * FROM star WHERE galaxy_id = 'g1' AND universe_time = 4200 AND mass>10"
        );
        assert_eq!(out.matches("universe_time").count(), 1);

        let appended = inject_partition_filter("SELECT * FROM star", "g1", 7);
        assert_eq!(
            appended,
            "SELECT * FROM star WHERE galaxy_id = 'g1' AND universe_time = 7"
        );
    }

    #[test]
    fn zero_universe_time_adds_nothing() {
        let out = inject_partition_filter("SELECT * FROM star LIMIT 1", "g1", 0);
        assert!(!out.contains("universe_time"));
    }

    #[test]
    fn quotes_in_galaxy_id_are_escaped() {
        let out = inject_partition_filter("SELECT * FROM star", "o'brien", 0);
        assert_eq!(out, "SELECT * FROM star WHERE galaxy_id = 'o''brien'");
    }
}
