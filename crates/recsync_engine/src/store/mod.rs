//! Local record storage.
//!
//! The engine talks to the on-device store through [`RecordStore`] and keeps
//! its per-model bookkeeping in a [`MetadataStore`]. Every pipeline mutation
//! is expressed as a list of [`StoreChange`]s applied atomically: either all
//! of them land or none does.

mod file;
mod memory;
mod table;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::SyncResult;
use crate::metadata::MetadataStore;
use crate::model::{Record, SyncStatus};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every record.
    All,
    /// Matches records whose status is one of the listed ones.
    Status(Vec<SyncStatus>),
    /// Matches records whose column equals the value.
    Eq {
        /// Column name (`id` and `client_id` included).
        column: String,
        /// Expected value.
        value: String,
    },
    /// Matches records whose column contains the substring.
    Contains {
        /// Column name.
        column: String,
        /// Substring to look for.
        needle: String,
    },
    /// All inner filters match.
    And(Vec<Filter>),
    /// At least one inner filter matches.
    Or(Vec<Filter>),
    /// The inner filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// Column equality.
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Substring match.
    pub fn contains(column: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            column: column.into(),
            needle: needle.into(),
        }
    }

    /// Status membership.
    pub fn status<I: IntoIterator<Item = SyncStatus>>(statuses: I) -> Self {
        Filter::Status(statuses.into_iter().collect())
    }

    /// Returns true if the record matches.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Status(statuses) => statuses.contains(&record.sync_status),
            Filter::Eq { column, value } => record.value(column).as_deref() == Some(value.as_str()),
            Filter::Contains { column, needle } => record
                .value(column)
                .is_some_and(|v| v.contains(needle.as_str())),
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(inner) => !inner.matches(record),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

/// Sort order of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Column to sort by.
    pub column: String,
    /// Ascending when true.
    pub ascending: bool,
}

impl Order {
    /// Compares two records by the order column.
    ///
    /// Numeric values compare numerically, everything else lexically; a
    /// missing value sorts first.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ordering = compare_values(a.value(&self.column), b.value(&self.column))
            .then_with(|| a.client_id.cmp(&b.client_id));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

fn compare_values(a: Option<String>, b: Option<String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(&b),
        },
    }
}

/// A local query: filter plus optional ordering.
///
/// Records waiting for deletion are hidden unless explicitly requested.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    /// Row filter.
    pub filter: Filter,
    /// Sort order; records come back in client-id order when absent.
    pub order: Option<Order>,
    /// Include records with status `Deleted`.
    pub include_deleted: bool,
}

impl Query {
    /// Matches every live record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches live records passing the filter.
    pub fn filter(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Sets the sort order.
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    /// Includes soft-deleted records.
    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Returns true if the record passes the query.
    pub fn matches(&self, record: &Record) -> bool {
        (self.include_deleted || record.sync_status != SyncStatus::Deleted)
            && self.filter.matches(record)
    }

    /// Runs the query over a set of records.
    pub fn run<'a, I>(&self, records: I) -> Vec<Record>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut out: Vec<Record> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        if let Some(order) = &self.order {
            out.sort_by(|a, b| order.compare(a, b));
        }
        out
    }
}

/// A single mutation of one model's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Local create. Fails if the client id is taken.
    Insert(Record),
    /// Local edit: merges fields, `Current` becomes `Updated`.
    Update {
        /// Record to edit.
        client_id: String,
        /// Fields to overwrite.
        fields: BTreeMap<String, String>,
    },
    /// Local delete: soft delete when the record has a server id, purge otherwise.
    MarkDeleted {
        /// Record to delete.
        client_id: String,
    },
    /// Push acknowledgement: assigns the server id and marks the record current
    /// unless it changed since `sent` was serialized.
    Acknowledge {
        /// Record that was sent.
        client_id: String,
        /// Id assigned by the server.
        server_id: i64,
        /// Fields as they were sent.
        sent: BTreeMap<String, String>,
    },
    /// Physical removal. A missing record is not an error.
    Purge {
        /// Record to remove.
        client_id: String,
    },
    /// Pulled row: overwrite the record with this server id (or client id), or insert it.
    UpsertRemote {
        /// Server id of the row.
        server_id: i64,
        /// Client id carried by the row, if any.
        client_id: Option<String>,
        /// Pulled fields.
        fields: BTreeMap<String, String>,
    },
    /// Pulled tombstone. A missing record is not an error.
    DeleteRemote {
        /// Server id of the deleted record.
        server_id: i64,
    },
}

/// Local record storage used by the engine.
pub trait RecordStore: Send + Sync {
    /// Runs a query against one model.
    fn query(&self, model: &str, query: &Query) -> SyncResult<Vec<Record>>;

    /// Looks up a record by client id.
    fn get(&self, model: &str, client_id: &str) -> SyncResult<Option<Record>>;

    /// Looks up a record by server id.
    fn find_by_server_id(&self, model: &str, server_id: i64) -> SyncResult<Option<Record>>;

    /// Applies the changes atomically.
    fn apply(&self, model: &str, changes: &[StoreChange]) -> SyncResult<()>;
}

/// A store holding both records and sync metadata.
pub trait SyncStore: RecordStore + MetadataStore {}

impl<T: RecordStore + MetadataStore + ?Sized> SyncStore for T {}
