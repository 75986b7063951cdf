//! Relay core: broadcast hub, file registry and transfer broker.
//!
//! # Architecture
//!
//! ```text
//!  peer (duplex channel)            requester / owner (calls)
//!        |                                   |
//!   dispatch / leave               request_file / offer_file
//!        |                                   |
//!  +-----v-----+    +--------------+    +----v-----------+
//!  | Broadcast | <- | FileRegistry | -> | TransferBroker |
//!  |    Hub    |    | id -> owner  |    | id -> tickets  |
//!  +-----------+    +--------------+    +----------------+
//! ```
//!
//! Each part has its own lock; nothing here serializes unrelated files or
//! connections behind one global lock. When two are held at once the hub's
//! is taken first (file announcements register under it).

pub mod broker;
pub mod dispatch;
pub mod hub;
pub mod ids;
pub mod registry;

pub use broker::{
    Completion, DownloadRequest, Matched, Parked, Refusal, Sink, TicketId, TransferBroker,
    TransferError,
};
pub use dispatch::Peer;
pub use hub::{BroadcastHub, HistoryHandle, Inbox, Published, Subscription};
pub use ids::IdAllocator;
pub use registry::{FileRecord, FileRegistry};

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::protocol::{FileId, RequestFile};

/// Default number of recorded frames kept for replay
pub const DEFAULT_HISTORY: usize = 999;

/// Default wait for an owner to start uploading
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a receiver may stay backed up before it is cut off
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable handle for one duplex-channel connection.
///
/// Registries store this instead of the connection itself, so tearing a
/// connection down is a lookup-and-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Recorded frames kept for replay; 0 disables history
    pub max_history: usize,
    /// How long a download waits for its upload to begin
    pub request_timeout: Duration,
    /// How long one receiver may hold up an upload
    pub stall_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_HISTORY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub subscribers: usize,
    pub history: usize,
    pub files: usize,
    pub queued: usize,
}

pub struct Relay {
    config: RelayConfig,
    ids: IdAllocator,
    hub: BroadcastHub,
    registry: Arc<FileRegistry>,
    broker: TransferBroker,
    next_conn: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(FileRegistry::new());
        Self {
            hub: BroadcastHub::new(config.max_history),
            broker: TransferBroker::new(registry.clone(), config.stall_timeout),
            registry,
            ids: IdAllocator::new(),
            next_conn: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &TransferBroker {
        &self.broker
    }

    /// Allocate an identifier for a file about to be announced.
    pub fn next_file_id(&self) -> FileId {
        self.ids.next_id()
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Park a download for `id` and ask its owner to upload.
    pub fn request_file(
        &self,
        id: FileId,
        request: DownloadRequest,
        sink: Sink,
    ) -> Result<Parked, Refusal> {
        let signal = RequestFile {
            id,
            range: request.range.clone(),
        };
        let parked = self.broker.park(id, request, sink)?;
        if !self.hub.send_to(parked.owner, signal.encode()) {
            // owner is mid-teardown; its departure cancels the ticket
            debug!(file = %id, owner = %parked.owner, "owner unreachable for upload signal");
        }
        Ok(parked)
    }

    /// Wait for a parked download to be served, bounded by the configured
    /// request timeout.
    pub async fn await_file<F>(&self, parked: Parked, hangup: F) -> Completion
    where
        F: Future<Output = ()>,
    {
        self.broker
            .wait(parked, self.config.request_timeout, hangup)
            .await
    }

    /// Requests an upload for `id` tagged with `range` would serve.
    pub fn offer_file(&self, id: FileId, range: &str) -> Matched {
        self.broker.match_tickets(id, range)
    }

    /// Stream an upload body to the matched requests.
    pub async fn deliver<R, P>(
        &self,
        matched: Matched,
        source: &mut R,
        prelude: P,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        P: Fn(&DownloadRequest) -> Bytes,
    {
        self.broker.stream_to(matched, source, prelude).await
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            subscribers: self.hub.subscriber_count(),
            history: self.hub.history_len(),
            files: self.registry.len(),
            queued: self.broker.total_queued(),
        }
    }
}
