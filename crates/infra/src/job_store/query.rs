//! Declarative document queries.
//!
//! A [`ScanQuery`] is a conjunction of conditions on top-level fields, an
//! optional newest-first ordering on a timestamp field, and an optional limit.
//! Backends that can filter server-side translate it; the others call
//! [`ScanQuery::evaluate`] on the documents they fetched.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::r#trait::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(&'static str, JsonValue),
    Exists(&'static str),
    Missing(&'static str),
    /// Timestamp field strictly earlier than the given instant.
    Before(&'static str, DateTime<Utc>),
}

impl Condition {
    pub fn eq(field: &'static str, value: impl Into<JsonValue>) -> Self {
        Condition::Eq(field, value.into())
    }

    pub fn exists(field: &'static str) -> Self {
        Condition::Exists(field)
    }

    pub fn missing(field: &'static str) -> Self {
        Condition::Missing(field)
    }

    pub fn before(field: &'static str, instant: DateTime<Utc>) -> Self {
        Condition::Before(field, instant)
    }

    pub fn field(&self) -> &'static str {
        match self {
            Condition::Eq(f, _) | Condition::Exists(f) | Condition::Missing(f) | Condition::Before(f, _) => f,
        }
    }

    pub fn matches(&self, body: &JsonValue) -> bool {
        let value = body.get(self.field()).filter(|v| !v.is_null());
        match self {
            Condition::Eq(_, expected) => value == Some(expected),
            Condition::Exists(_) => value.is_some(),
            Condition::Missing(_) => value.is_none(),
            Condition::Before(_, instant) => value.and_then(timestamp_of).is_some_and(|t| t < *instant),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanQuery {
    pub conditions: Vec<Condition>,
    /// Sort descending by this timestamp field.
    pub newest_first: Option<&'static str>,
    pub limit: Option<usize>,
}

impl ScanQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn newest_first(mut self, field: &'static str) -> Self {
        self.newest_first = Some(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, body: &JsonValue) -> bool {
        self.conditions.iter().all(|c| c.matches(body))
    }

    /// In-process evaluation: filter, order, then limit.
    pub fn evaluate(&self, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut matching: Vec<Document> = documents.into_iter().filter(|d| self.matches(&d.body)).collect();

        match self.newest_first {
            Some(field) => matching.sort_by(|a, b| compare_newest_first(field, a, b)),
            None => matching.sort_by(|a, b| a.key.cmp(&b.key)),
        }
        if let Some(limit) = self.limit {
            matching.truncate(limit);
        }
        matching
    }
}

pub(crate) fn timestamp_of(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// Documents without the field sort last; ties break on key for stable output.
fn compare_newest_first(field: &str, a: &Document, b: &Document) -> Ordering {
    let ta = a.body.get(field).and_then(timestamp_of);
    let tb = b.body.get(field).and_then(timestamp_of);
    match (ta, tb) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.key.cmp(&b.key)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.key.cmp(&b.key),
    }
}
