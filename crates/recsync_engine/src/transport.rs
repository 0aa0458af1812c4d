//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use recsync_protocol::{BatchRequest, ReadRequest, ReadResponse, WriteResponse};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.). Implementations map the
/// server's answer onto [`SyncError`]: a rejected credential becomes
/// [`SyncError::Unauthorized`], any other non-success status a
/// [`SyncError::Server`], and an unreachable server a retryable
/// [`SyncError::Transport`].
pub trait SyncTransport: Send + Sync + 'static {
    /// Sends created and updated records. Returns the server id of each.
    fn create_or_update(
        &self,
        request: &BatchRequest,
    ) -> impl Future<Output = SyncResult<WriteResponse>> + Send;

    /// Sends deleted records.
    fn delete(&self, request: &BatchRequest) -> impl Future<Output = SyncResult<()>> + Send;

    /// Fetches rows changed since the request's watermark.
    fn read(&self, request: &ReadRequest) -> impl Future<Output = SyncResult<ReadResponse>> + Send;
}

/// Maps an HTTP status and body onto the engine's error taxonomy.
pub fn check_status(status: u16, body: String) -> SyncResult<String> {
    match status {
        200 => Ok(body),
        403 => Err(SyncError::Unauthorized(if body.is_empty() {
            "forbidden".to_string()
        } else {
            body
        })),
        _ => Err(SyncError::Server {
            status,
            message: body,
        }),
    }
}

/// A scripted answer of the [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Status 200 with this body.
    Body(String),
    /// This status with an empty body.
    Status(u16),
    /// The server could not be reached.
    Network(String),
}

/// A request seen by the [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// A create/update request.
    CreateOrUpdate(BatchRequest),
    /// A delete request.
    Delete(BatchRequest),
    /// A read request.
    Read(ReadRequest),
}

/// A mock transport for testing.
///
/// Each operation answers from its own queue of [`MockReply`]s. An empty
/// queue behaves like an unreachable server.
#[derive(Debug, Default)]
pub struct MockTransport {
    writes: Mutex<VecDeque<MockReply>>,
    deletes: Mutex<VecDeque<MockReply>>,
    reads: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<MockCall>>,
    latency: Mutex<Duration>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an answer for the next create/update request.
    pub fn push_write(&self, reply: MockReply) -> &Self {
        self.writes.lock().push_back(reply);
        self
    }

    /// Queues an answer for the next delete request.
    pub fn push_delete(&self, reply: MockReply) -> &Self {
        self.deletes.lock().push_back(reply);
        self
    }

    /// Queues an answer for the next read request.
    pub fn push_read(&self, reply: MockReply) -> &Self {
        self.reads.lock().push_back(reply);
        self
    }

    /// Delays every answer.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Returns every request seen so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Returns the read requests seen so far.
    pub fn reads(&self) -> Vec<ReadRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Read(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    async fn answer(&self, call: MockCall) -> SyncResult<String> {
        let queue = match &call {
            MockCall::CreateOrUpdate(_) => &self.writes,
            MockCall::Delete(_) => &self.deletes,
            MockCall::Read(_) => &self.reads,
        };
        self.calls.lock().push(call);
        let reply = queue.lock().pop_front();
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Some(MockReply::Body(body)) => Ok(body),
            Some(MockReply::Status(status)) => check_status(status, String::new()),
            Some(MockReply::Network(message)) => Err(SyncError::transport_retryable(message)),
            None => Err(SyncError::transport_retryable("no mock reply queued")),
        }
    }
}

impl SyncTransport for MockTransport {
    async fn create_or_update(&self, request: &BatchRequest) -> SyncResult<WriteResponse> {
        let body = self.answer(MockCall::CreateOrUpdate(request.clone())).await?;
        Ok(WriteResponse::parse(&body)?)
    }

    async fn delete(&self, request: &BatchRequest) -> SyncResult<()> {
        self.answer(MockCall::Delete(request.clone())).await?;
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> SyncResult<ReadResponse> {
        let body = self.answer(MockCall::Read(request.clone())).await?;
        Ok(ReadResponse::parse(&body)?)
    }
}
