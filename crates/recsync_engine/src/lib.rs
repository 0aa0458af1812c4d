//! # recsync engine
//!
//! Offline-first synchronization between a local record store and a remote
//! record server.
//!
//! This crate provides:
//! - A model registry describing each synchronized record type
//! - Record and metadata stores (in-memory and JSON file)
//! - Time-bounded read and write leases per model
//! - A push pipeline for locally created, updated and deleted records
//! - An incremental, watermark-driven pull pipeline
//! - A freshness-gated query path with background refresh
//! - Bounded retries with exponential backoff
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! A sync run pushes each model and then pulls it:
//! 1. Push local changes under the model's write lease
//! 2. Pull changes newer than the stored watermark under the read lease
//! 3. Advance the watermark only after every pulled row was applied
//!
//! ## Key Invariants
//!
//! - At most one push and one pull per model at a time
//! - A lease that cannot be taken is skipped, never waited on
//! - Store mutations of a phase are applied atomically
//! - The watermark never moves backwards
//! - A pushed record is never duplicated locally

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod credential;
mod engine;
mod error;
mod events;
mod http;
mod lease;
mod metadata;
mod model;
mod pull;
mod push;
mod query;
mod report;
mod retry;
pub mod store;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use credential::{Anonymous, Credential, CredentialCell, CredentialProvider};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, SyncPhase, SyncStats};
pub use http::{HttpClient, HttpRequest, HttpResponse, HttpTransport, ReqwestClient};
pub use lease::{LeaseGuard, LeaseManager};
pub use metadata::{LeaseKind, MetadataStore, SyncMetadata};
pub use model::{ModelDescriptor, ModelRegistry, ModelSchema, Record, SyncStatus};
pub use pull::plan_pull;
pub use query::{
    BelatedResponse, PendingRefresh, QueryListener, QueryResult, NOT_REACHABLE, REFRESH_SKIPPED,
};
pub use report::{ModelReport, PhaseOutcome, SkipReason, SyncReport};
pub use retry::{RetryDecision, RetryScheduler};
pub use store::{FileStore, Filter, MemoryStore, Order, Query, RecordStore, StoreChange, SyncStore};
pub use transport::{check_status, MockCall, MockReply, MockTransport, SyncTransport};
