//! Encoding errors for blocks and packets.

use std::fmt;

/// Errors that can occur while encoding outbound data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A column holds a different number of values than its block.
    RowCountMismatch {
        column: String,
        expected: u64,
        actual: u64,
    },
    /// A column payload cannot be read as whole values of its type.
    InvalidPayload { column: String, reason: String },
    /// A block without columns claims to have rows.
    RowsWithoutColumns(u64),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::RowCountMismatch { column, expected, actual } => write!(
                f,
                "Column '{}' has {} rows but its block has {}",
                column, actual, expected
            ),
            EncodeError::InvalidPayload { column, reason } => {
                write!(f, "Column '{}' has an invalid payload: {}", column, reason)
            }
            EncodeError::RowsWithoutColumns(rows) => {
                write!(f, "Block has {} rows but no columns", rows)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_error_display() {
        let err = EncodeError::RowCountMismatch {
            column: "id".to_string(),
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("'id' has 2 rows"));
        assert!(EncodeError::RowsWithoutColumns(5).to_string().contains("no columns"));
    }
}
