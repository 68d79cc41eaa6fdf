//! Graph infrastructure implementations
//!
//! SQLite implementations of the graph repository traits. Each trait lives in
//! its own file; all of them share one pool.

mod cache;
mod links;
mod metrics;
mod nodes;
mod reviews;
mod rules;
mod signals;
mod stories;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::domain::graph::{NodeRef, NodeType};
use crate::error::{Error, Result};

/// SQLite implementation of every graph repository
#[derive(Clone)]
pub struct SqliteGraphRepository {
    pool: SqlitePool,
}

impl SqliteGraphRepository {
    /// Create a new SQLite graph repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON column; a corrupt value is an error, never a default
fn from_json<T: DeserializeOwned>(column: &str, value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|e| {
        tracing::warn!(column, error = %e, "Corrupt JSON column");
        Error::Serialization(e)
    })
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid {} timestamp '{}': {}", column, value, e)))
}

fn parse_optional_timestamp(column: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, v)).transpose()
}

fn parse_date(column: &str, value: Option<&str>) -> Result<Option<NaiveDate>> {
    value
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|e| Error::Other(format!("Invalid {} date '{}': {}", column, v, e)))
        })
        .transpose()
}

/// Parse a stored vocabulary value with its type's `parse`
fn parse_vocab<T>(what: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| Error::Other(format!("Invalid {}: {}", what, value)))
}

fn node_ref(node_type: &str, node_id: String) -> Result<NodeRef> {
    let node_type = parse_vocab("node type", node_type, NodeType::parse)?;
    Ok(NodeRef::new(node_type, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_json_is_an_error() {
        let result: Result<Vec<String>> = from_json("tags", "{broken");
        assert!(matches!(result, Err(Error::Serialization(_))));
        let tags: Vec<String> = from_json("tags", r#"["a","b"]"#).unwrap();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn test_timestamps_are_strict() {
        assert!(parse_timestamp("created_at", "yesterday").is_err());
        let ts = Utc::now();
        assert_eq!(parse_timestamp("created_at", &ts.to_rfc3339()).unwrap(), ts);
    }

    #[test]
    fn test_node_ref_rejects_unknown_type() {
        assert!(node_ref("planet", "earth".into()).is_err());
        assert_eq!(
            node_ref("sector", "banking".into()).unwrap(),
            NodeRef::sector("banking")
        );
    }
}
