//! Typed search attributes for cross-workflow queries
//!
//! Search attributes are indexed key/value pairs a workflow upserts about
//! itself. Reviewers find suspended workflows by querying the index with an
//! [`AttributeFilter`] rather than scanning histories. Upserted values become
//! queryable within the index refresh interval (at most five seconds; the
//! bundled stores index synchronously).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved attribute names understood by the review tooling.
///
/// Workflows may upsert arbitrary names; these are the ones the platform
/// indexes with dedicated query paths.
pub mod keys {
    pub const ASSIGNEE: &str = "Assignee";
    pub const QUEUE: &str = "Queue";
    pub const STATUS: &str = "Status";
    pub const PRIORITY: &str = "Priority";
    pub const DUE_AT: &str = "DueAt";
    pub const TENANT: &str = "Tenant";
    pub const DOCUMENT_ID: &str = "DocumentId";
    pub const CONTRIBUTOR_ID: &str = "ContributorId";
    pub const RELEVANCE_SCORE: &str = "RelevanceScore";
}

/// A scalar attribute value.
///
/// The store keeps one column per variant so predicates can use native
/// comparisons instead of JSON extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn number(value: f64) -> Self {
        Self::Number(value)
    }

    pub fn time(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }

    /// The text payload, if this is a text attribute.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric payload, if this is a number attribute.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

/// An attribute map as carried by upsert decisions and events.
///
/// `BTreeMap` keeps iteration order deterministic, which matters during
/// replay.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Equality predicate over search attributes.
///
/// # Example
///
/// ```
/// use tessera_durable::workflow::attributes::{keys, AttributeFilter};
///
/// let filter = AttributeFilter::new()
///     .eq(keys::STATUS, "pending")
///     .eq(keys::QUEUE, "document-review");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeFilter {
    /// Conjunction of `attribute == value` terms.
    pub equals: Vec<(String, AttributeValue)>,
}

impl AttributeFilter {
    /// Create an empty filter (matches every execution with attributes).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality term.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    /// Whether the filter has no terms.
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    /// Evaluate the filter against an attribute map.
    pub fn matches(&self, attributes: &AttributeMap) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| attributes.get(key) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attributes() -> AttributeMap {
        let mut map = AttributeMap::new();
        map.insert(keys::STATUS.into(), AttributeValue::text("pending"));
        map.insert(keys::QUEUE.into(), AttributeValue::text("document-review"));
        map.insert(keys::RELEVANCE_SCORE.into(), AttributeValue::number(6.5));
        map
    }

    #[test]
    fn test_filter_matches_conjunction() {
        let filter = AttributeFilter::new()
            .eq(keys::STATUS, "pending")
            .eq(keys::QUEUE, "document-review");

        assert!(filter.matches(&sample_attributes()));
    }

    #[test]
    fn test_filter_rejects_mismatch() {
        let filter = AttributeFilter::new().eq(keys::STATUS, "approved");
        assert!(!filter.matches(&sample_attributes()));
    }

    #[test]
    fn test_filter_rejects_missing_key() {
        let filter = AttributeFilter::new().eq(keys::ASSIGNEE, "controller");
        assert!(!filter.matches(&sample_attributes()));
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(AttributeFilter::new().matches(&sample_attributes()));
    }

    #[test]
    fn test_number_equality() {
        let filter = AttributeFilter::new().eq(keys::RELEVANCE_SCORE, 6.5);
        assert!(filter.matches(&sample_attributes()));
    }

    #[test]
    fn test_attribute_value_serialization() {
        let value = AttributeValue::text("pending");
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"type\":\"text\""));

        let parsed: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, parsed);
    }
}
