use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::event::Row;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty row filter")]
    Empty,
    #[error("unsupported row filter `{0}`: expected `column=eq.value` or `column = value`")]
    Unsupported(String),
}

/// Equality predicate on a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    column: String,
    value: String,
}

impl RowFilter {
    pub fn equals(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl FromStr for RowFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FilterError::Empty);
        }

        let (column, rhs) = s
            .split_once('=')
            .ok_or_else(|| FilterError::Unsupported(s.to_string()))?;
        let column = column.trim();
        let rhs = rhs.trim();
        let value = rhs.strip_prefix("eq.").unwrap_or(rhs);

        if column.is_empty() || value.is_empty() || value.contains('=') {
            return Err(FilterError::Unsupported(s.to_string()));
        }

        Ok(RowFilter::equals(column, value))
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_both_forms() {
        let a: RowFilter = "client_id=eq.42".parse().unwrap();
        let b: RowFilter = "client_id = 42".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "client_id=eq.42");
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!("".parse::<RowFilter>(), Err(FilterError::Empty));
        assert!("client_id".parse::<RowFilter>().is_err());
        assert!("=eq.1".parse::<RowFilter>().is_err());
    }

    #[test]
    fn test_matches_scalars_textually() {
        let filter = RowFilter::equals("request_id", "abc");
        assert!(filter.matches(&row(json!({ "request_id": "abc" }))));
        assert!(!filter.matches(&row(json!({ "request_id": "abd" }))));
        assert!(!filter.matches(&row(json!({ "other": "abc" }))));

        let numeric = RowFilter::equals("id", 7);
        assert!(numeric.matches(&row(json!({ "id": 7 }))));
        assert!(!numeric.matches(&row(json!({ "id": null }))));
    }
}
