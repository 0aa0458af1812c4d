//! Protocol messages for sync.

use crate::codec::{join_line, split_line, split_lines};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Column carrying the server-assigned identifier.
pub const ID_COLUMN: &str = "id";
/// Column carrying the client-assigned identifier.
pub const CLIENT_ID_COLUMN: &str = "client_id";
/// Column marking a row as a tombstone.
pub const DELETE_COLUMN: &str = "delete";
/// Value of [`DELETE_COLUMN`] that marks a tombstone.
pub const TOMBSTONE_VALUE: &str = "true";

/// A batch of records in wire form: a header line followed by one line per record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBatch {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RecordBatch {
    /// Creates an empty batch with the given column header.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row. The row must have one value per column.
    pub fn push_row(&mut self, row: Vec<String>) -> ProtocolResult<()> {
        if row.len() != self.columns.len() {
            return Err(ProtocolError::ColumnCount {
                line: self.rows.len() + 1,
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Returns the column header.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows.
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encodes to the wire body.
    pub fn encode(&self) -> String {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(join_line(&self.columns));
        lines.extend(self.rows.iter().map(|row| join_line(row)));
        lines.join("\n")
    }

    /// Decodes from a wire body.
    pub fn decode(body: &str) -> ProtocolResult<Self> {
        let lines = split_lines(body);
        let header = lines.first().ok_or(ProtocolError::MissingHeader)?;
        let mut batch = Self::new(split_line(header));
        for (index, line) in lines.iter().enumerate().skip(1) {
            if line.is_empty() {
                continue;
            }
            let row = split_line(line);
            if row.len() != batch.columns.len() {
                return Err(ProtocolError::ColumnCount {
                    line: index,
                    expected: batch.columns.len(),
                    found: row.len(),
                });
            }
            batch.rows.push(row);
        }
        Ok(batch)
    }
}

/// A create/update or delete request.
#[derive(Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Model version tag.
    pub version: u32,
    /// Remote table name.
    pub table: String,
    /// Remote view name.
    pub view: String,
    /// Bearer credential, empty when anonymous.
    pub credential: String,
    /// The records.
    pub batch: RecordBatch,
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("version", &self.version)
            .field("table", &self.table)
            .field("view", &self.view)
            .field("credential", &redact(&self.credential))
            .field("records", &self.batch.len())
            .finish()
    }
}

/// An incremental read request.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Model version tag.
    pub version: u32,
    /// Remote table name.
    pub table: String,
    /// Remote view name.
    pub view: String,
    /// Bearer credential, empty when anonymous.
    pub credential: String,
    /// Watermark of the last applied pull, `None` when never synced.
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ReadRequest {
    /// Returns the watermark as sent on the wire (empty when never synced).
    pub fn last_timestamp_param(&self) -> String {
        self.last_timestamp
            .map(format_timestamp)
            .unwrap_or_default()
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("version", &self.version)
            .field("table", &self.table)
            .field("view", &self.view)
            .field("credential", &redact(&self.credential))
            .field("last_timestamp", &self.last_timestamp)
            .finish()
    }
}

fn redact(credential: &str) -> &'static str {
    if credential.is_empty() {
        "[NONE]"
    } else {
        "[REDACTED]"
    }
}

/// Formats a timestamp the way the server expects it.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// One `serverId|clientId` acknowledgement of a create/update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Identifier assigned by the server.
    pub server_id: i64,
    /// Identifier the client sent.
    pub client_id: String,
}

/// Response to a create/update request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteResponse {
    /// Metadata line, not interpreted by the client.
    pub meta: String,
    /// One acknowledgement per written record.
    pub acks: Vec<WriteAck>,
}

impl WriteResponse {
    /// Parses a create/update response body.
    pub fn parse(body: &str) -> ProtocolResult<Self> {
        let lines = split_lines(body);
        let meta = lines.first().ok_or(ProtocolError::MissingMetadata)?;

        let mut acks = Vec::with_capacity(lines.len().saturating_sub(1));
        for (index, line) in lines.iter().enumerate().skip(1) {
            if line.is_empty() {
                continue;
            }
            let values = split_line(line);
            if values.len() < 2 || values[1].is_empty() {
                return Err(ProtocolError::MalformedAck { line: index });
            }
            let server_id = parse_id(&values[0], index)?;
            acks.push(WriteAck {
                server_id,
                client_id: values[1].clone(),
            });
        }

        Ok(Self {
            meta: (*meta).to_string(),
            acks,
        })
    }

    /// Encodes to a response body.
    pub fn encode(&self) -> String {
        let mut lines = vec![self.meta.clone()];
        lines.extend(
            self.acks
                .iter()
                .map(|ack| join_line([ack.server_id.to_string(), ack.client_id.clone()])),
        );
        lines.join("\n")
    }
}

/// One data row of a read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    server_id: i64,
    fields: BTreeMap<String, String>,
}

impl Row {
    /// Creates a row; the `id` column is set from `server_id`.
    pub fn new(server_id: i64, mut fields: BTreeMap<String, String>) -> Self {
        fields.insert(ID_COLUMN.to_string(), server_id.to_string());
        Self { server_id, fields }
    }

    /// Returns the server id of the row.
    pub fn server_id(&self) -> i64 {
        self.server_id
    }

    /// Returns true if the row is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.fields.get(DELETE_COLUMN).map(String::as_str) == Some(TOMBSTONE_VALUE)
    }

    /// Returns a field value by column name.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// Returns all values keyed by column name, reserved columns included.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Response to an incremental read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// First metadata value, not interpreted by the client.
    pub meta: String,
    /// New server watermark.
    pub watermark: DateTime<Utc>,
    /// Column header.
    pub columns: Vec<String>,
    /// Data rows.
    pub rows: Vec<Row>,
}

impl ReadResponse {
    /// Parses an incremental read response body.
    ///
    /// The whole body is validated before anything is returned, so a caller
    /// never sees a partially parsed response.
    pub fn parse(body: &str) -> ProtocolResult<Self> {
        let lines = split_lines(body);

        let meta_line = lines.first().ok_or(ProtocolError::MissingMetadata)?;
        let meta = split_line(meta_line);
        let raw_watermark = meta
            .get(1)
            .ok_or_else(|| ProtocolError::InvalidWatermark(String::new()))?;
        let watermark = DateTime::parse_from_rfc3339(raw_watermark.trim())
            .map_err(|_| ProtocolError::InvalidWatermark(raw_watermark.clone()))?
            .with_timezone(&Utc);

        let header = lines.get(1).ok_or(ProtocolError::MissingHeader)?;
        let columns: Vec<String> = split_line(header)
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        let id_index = columns
            .iter()
            .position(|c| c == ID_COLUMN)
            .ok_or(ProtocolError::MissingIdColumn)?;

        let mut rows = Vec::with_capacity(lines.len().saturating_sub(2));
        for (index, line) in lines.iter().enumerate().skip(2) {
            if line.is_empty() {
                continue;
            }
            let values = split_line(line);
            if values.len() != columns.len() {
                return Err(ProtocolError::ColumnCount {
                    line: index,
                    expected: columns.len(),
                    found: values.len(),
                });
            }
            let server_id = parse_id(&values[id_index], index)?;
            let fields = columns.iter().cloned().zip(values).collect();
            rows.push(Row { server_id, fields });
        }

        Ok(Self {
            meta: meta[0].clone(),
            watermark,
            columns,
            rows,
        })
    }

    /// Encodes to a response body.
    pub fn encode(&self) -> String {
        let mut lines = vec![
            join_line([self.meta.clone(), format_timestamp(self.watermark)]),
            join_line(&self.columns),
        ];
        for row in &self.rows {
            lines.push(join_line(self.columns.iter().map(|c| {
                row.fields.get(c).map(String::as_str).unwrap_or_default()
            })));
        }
        lines.join("\n")
    }
}

fn parse_id(value: &str, line: usize) -> ProtocolResult<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidServerId {
            line,
            value: value.to_string(),
        })
}
