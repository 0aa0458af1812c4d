//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when a body does not match the expected line/column shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The body has no metadata line.
    #[error("response is missing the metadata line")]
    MissingMetadata,

    /// The read response has no column header line.
    #[error("response is missing the column header")]
    MissingHeader,

    /// The column header does not name an `id` column.
    #[error("column header has no `id` column")]
    MissingIdColumn,

    /// The watermark in the metadata line is missing or not RFC 3339.
    #[error("invalid watermark timestamp: {0:?}")]
    InvalidWatermark(String),

    /// A server id could not be parsed as an integer.
    #[error("line {line}: invalid server id {value:?}")]
    InvalidServerId {
        /// Zero-based line number in the body.
        line: usize,
        /// The offending value.
        value: String,
    },

    /// A row has a different number of values than the header.
    #[error("line {line}: expected {expected} values, found {found}")]
    ColumnCount {
        /// Zero-based line number in the body.
        line: usize,
        /// Number of header columns.
        expected: usize,
        /// Number of values on the line.
        found: usize,
    },

    /// An acknowledgement line is not `serverId|clientId`.
    #[error("line {line}: malformed acknowledgement")]
    MalformedAck {
        /// Zero-based line number in the body.
        line: usize,
    },
}
