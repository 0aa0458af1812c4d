//! # recsync Protocol
//!
//! Wire protocol types and codecs for recsync.
//!
//! This crate provides:
//! - The line codec (`|` separated values, `\n` separated lines, backslash escapes)
//! - `RecordBatch` for create/update and delete request bodies
//! - `BatchRequest` and `ReadRequest` messages
//! - `WriteResponse` and `ReadResponse` parsers
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Read response shape
//!
//! ```text
//! <meta>|<watermark>        line 0, watermark is RFC 3339
//! id|text|delete            line 1, column header
//! 7|hello|                  lines 2.., one row per record
//! 8||true                   a tombstone
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{escape, join_line, split_line, split_lines};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BatchRequest, ReadRequest, ReadResponse, RecordBatch, Row, WriteAck, WriteResponse,
    CLIENT_ID_COLUMN, DELETE_COLUMN, ID_COLUMN, TOMBSTONE_VALUE,
};
