//! Retry-name entries for append conflict negotiation
//!
//! Each entry is `<first>,<count>:<replicationName>`; a retry packet carries
//! a list of them. Every replica decodes the same list and must derive the
//! same key assignment, so parsing has to be strict.

use opal_common::{DbError, Result};
use std::fmt;
use std::str::FromStr;

/// One replica's claim in an append conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRetryName {
    /// Start key the replica assigned before the conflict was detected
    pub first: i64,
    /// Number of rows the replica is appending
    pub count: i32,
    /// The replica's replication name
    pub replication_name: String,
}

impl AppendRetryName {
    pub fn new(first: i64, count: i32, replication_name: impl Into<String>) -> Self {
        Self {
            first,
            count,
            replication_name: replication_name.into(),
        }
    }
}

impl fmt::Display for AppendRetryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}:{}", self.first, self.count, self.replication_name)
    }
}

impl FromStr for AppendRetryName {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        let colon = s
            .find(':')
            .ok_or_else(|| DbError::DeserializationFailed(format!("retry name {:?}", s)))?;
        let (keys, name) = s.split_at(colon);
        let name = &name[1..];
        let mut parts = keys.split(',');
        let first = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| DbError::DeserializationFailed(format!("retry name {:?}", s)))?;
        let count = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(|| DbError::DeserializationFailed(format!("retry name {:?}", s)))?;
        if parts.next().is_some() || name.is_empty() {
            return Err(DbError::DeserializationFailed(format!("retry name {:?}", s)));
        }
        Ok(AppendRetryName::new(first, count, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let entry = AppendRetryName::new(100, 3, "node1:42");
        let text = entry.to_string();
        assert_eq!(text, "100,3:node1:42");
        assert_eq!(text.parse::<AppendRetryName>().unwrap(), entry);
    }

    #[test]
    fn test_parse_splits_on_first_colon() {
        // replication names may themselves contain colons
        let entry: AppendRetryName = "7,2:10.0.0.1:9210,x".parse().unwrap();
        assert_eq!(entry.first, 7);
        assert_eq!(entry.count, 2);
        assert_eq!(entry.replication_name, "10.0.0.1:9210,x");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<AppendRetryName>().is_err());
        assert!("1,2".parse::<AppendRetryName>().is_err());
        assert!("a,2:r".parse::<AppendRetryName>().is_err());
        assert!("1:r".parse::<AppendRetryName>().is_err());
        assert!("1,2:".parse::<AppendRetryName>().is_err());
    }
}
