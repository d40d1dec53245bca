//! Error types for record parsing

use thiserror::Error;

/// Reasons a reassembled line is not a valid `amplitude,tof` record.
///
/// These never leave the ingest path: a malformed line is dropped and
/// counted, and the next line is parsed as if nothing happened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Line did not split into exactly two comma-separated fields
    #[error("Expected 2 fields, got {0}")]
    FieldCount(usize),

    /// A field is not a decimal floating-point number
    #[error("Invalid number in field {index}: '{text}'")]
    InvalidNumber { index: usize, text: String },

    /// A field parsed, but to NaN or infinity
    #[error("Non-finite value in field {index}")]
    NonFinite { index: usize },
}
