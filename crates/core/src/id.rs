//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a single job execution.
///
/// Opaque to the rest of the system. Freshly generated ids are UUIDv7 strings
/// (time-ordered), but any non-empty string without whitespace is accepted so
/// ids minted by other processes round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new identifier.
    ///
    /// Prefer passing ids explicitly in tests for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DomainError::invalid_id("JobId: empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(DomainError::invalid_id(format!("JobId: contains whitespace: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_parseable() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(JobId::from_str(a.as_str()).unwrap(), a);
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(JobId::from_str("").is_err());
        assert!(JobId::from_str("job 1").is_err());
        assert_eq!(JobId::from_str("J1").unwrap().as_str(), "J1");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id: JobId = "J1".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"J1\"");
    }
}
