//! Transfer broker: parks download requests until the owner uploads.
//!
//! Each file id with outstanding requests has its own queue. A parked ticket
//! holds a take-once slot with the requester's sink and completion sender;
//! whichever path takes the slot first (a matching upload, the deadline, the
//! owner leaving, or the requester hanging up) settles the ticket, and every
//! other path finds the slot empty and backs off.
//!
//! Matching is by exact range-token equality. The broker never interprets
//! the token; it only promises that an upload tagged `T` reaches every
//! request still waiting with `T` for the same id.

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::registry::FileRegistry;
use super::ConnId;
use crate::protocol::FileId;

/// Read size when pumping an upload body
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered per receiver before it counts as stalled
pub const SINK_QUEUE_DEPTH: usize = 16;

/// Where a requester's bytes go
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file {0} not found")]
    NotFound(FileId),

    #[error("no upload arrived within {0:?}")]
    Timeout(Duration),

    #[error("owner of file {0} disconnected")]
    OwnerGone(FileId),

    #[error("requester disconnected")]
    RequesterGone,

    #[error("all {0} receivers failed")]
    AllSinksFailed(usize),

    #[error("upload body failed: {0}")]
    Source(#[from] io::Error),
}

/// What a requester asked for. Only `range` takes part in matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Opaque correlation token, empty for the whole file
    pub range: String,
    /// Requester wants to view the file rather than save it
    pub inline: bool,
}

/// A request the broker gave back unserved, with its sink so the caller
/// can still answer it.
pub struct Refusal {
    pub reason: TransferError,
    pub sink: Sink,
}

impl fmt::Debug for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refusal")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// How a parked request ended
#[derive(Debug)]
pub enum Completion {
    /// An upload streamed this many body bytes to the requester
    Delivered(u64),
    /// The upload reached the requester but its sink or the source broke
    Failed(String),
    /// Never served
    Cancelled(Refusal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(u64);

struct Waiter {
    sink: Sink,
    done: oneshot::Sender<Completion>,
}

struct Pending {
    ticket: TicketId,
    request: DownloadRequest,
    /// `None` once claimed by an upload that is still streaming
    waiter: Option<Waiter>,
}

#[derive(Default)]
struct Queue {
    entries: Vec<Pending>,
    /// Set when the queue emptied and is being dropped from the map
    retired: bool,
}

type QueueCell = Arc<Mutex<Queue>>;

/// Handle returned by [`TransferBroker::park`]
#[derive(Debug)]
pub struct Parked {
    pub id: FileId,
    pub ticket: TicketId,
    /// Connection that must be asked to upload
    pub owner: ConnId,
    done: oneshot::Receiver<Completion>,
}

/// One matched request, ready to receive bytes
pub struct MatchedTicket {
    pub ticket: TicketId,
    pub request: DownloadRequest,
    waiter: Waiter,
}

/// Requests selected for one upload. Their queue entries stay in place
/// until this is dropped, so nothing else can settle them meanwhile.
pub struct Matched {
    broker: TransferBroker,
    id: FileId,
    tickets: Vec<MatchedTicket>,
    claimed: Vec<TicketId>,
}

impl Matched {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn tickets(&self) -> impl Iterator<Item = TicketId> + '_ {
        self.tickets.iter().map(|t| t.ticket)
    }
}

impl Drop for Matched {
    fn drop(&mut self) {
        // Anything still held here was never streamed to.
        for t in self.tickets.drain(..) {
            let _ = t
                .waiter
                .done
                .send(Completion::Failed("upload abandoned".to_string()));
        }
        if !self.claimed.is_empty() {
            let claimed = std::mem::take(&mut self.claimed);
            self.broker
                .with_queue(self.id, |entries| entries.retain(|p| !claimed.contains(&p.ticket)));
        }
    }
}

struct Inner {
    registry: Arc<FileRegistry>,
    queues: RwLock<HashMap<FileId, QueueCell>>,
    next_ticket: AtomicU64,
    stall_timeout: Duration,
}

/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct TransferBroker {
    inner: Arc<Inner>,
}

impl TransferBroker {
    pub fn new(registry: Arc<FileRegistry>, stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                queues: RwLock::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                stall_timeout,
            }),
        }
    }

    /// Queue a request for `id`. Fails with NotFound when nobody owns it.
    ///
    /// The caller must then signal `Parked::owner` with the same id and
    /// range token so the eventual upload matches.
    pub fn park(&self, id: FileId, request: DownloadRequest, sink: Sink) -> Result<Parked, Refusal> {
        let Some(owner) = self.inner.registry.owner_of(id) else {
            return Err(Refusal {
                reason: TransferError::NotFound(id),
                sink,
            });
        };

        let ticket = TicketId(self.inner.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (done_tx, done) = oneshot::channel();
        let mut pending = Some(Pending {
            ticket,
            request,
            waiter: Some(Waiter {
                sink,
                done: done_tx,
            }),
        });

        while let Some(p) = pending.take() {
            let cell = self.queue_or_insert(id);
            let mut queue = cell.lock();
            if queue.retired {
                drop(queue);
                self.forget(id, &cell);
                pending = Some(p);
                continue;
            }
            queue.entries.push(p);
        }

        // The owner may have left between the lookup and the insert, after
        // its queues were already cancelled. Take the ticket back if so.
        if self.inner.registry.owner_of(id).is_none() {
            if let Some(waiter) = self.claim(id, ticket) {
                return Err(Refusal {
                    reason: TransferError::NotFound(id),
                    sink: waiter.sink,
                });
            }
        }

        debug!(file = %id, ticket = ticket.0, owner = %owner, "request parked");
        Ok(Parked {
            id,
            ticket,
            owner,
            done,
        })
    }

    /// Wait for a parked request to be served.
    ///
    /// Resolves on a matching upload, on `deadline`, on the owner leaving,
    /// or when `hangup` completes (the requester went away). Once an upload
    /// has claimed the ticket the deadline no longer applies.
    pub async fn wait<F>(&self, parked: Parked, deadline: Duration, hangup: F) -> Completion
    where
        F: Future<Output = ()>,
    {
        let Parked {
            id,
            ticket,
            mut done,
            ..
        } = parked;

        let reason = tokio::select! {
            res = &mut done => return settled(res),
            _ = tokio::time::sleep(deadline) => TransferError::Timeout(deadline),
            _ = hangup => TransferError::RequesterGone,
        };

        match self.claim(id, ticket) {
            Some(waiter) => {
                debug!(file = %id, ticket = ticket.0, %reason, "request withdrawn");
                Completion::Cancelled(Refusal {
                    reason,
                    sink: waiter.sink,
                })
            }
            None => settled(done.await),
        }
    }

    /// Select every waiting request for `id` whose token equals `range`,
    /// in arrival order.
    pub fn match_tickets(&self, id: FileId, range: &str) -> Matched {
        let tickets = self
            .with_queue(id, |entries| {
                entries
                    .iter_mut()
                    .filter(|p| p.waiter.is_some() && p.request.range == range)
                    .filter_map(|p| {
                        let waiter = p.waiter.take()?;
                        Some(MatchedTicket {
                            ticket: p.ticket,
                            request: p.request.clone(),
                            waiter,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Matched {
            broker: self.clone(),
            id,
            claimed: tickets.iter().map(|t| t.ticket).collect(),
            tickets,
        }
    }

    /// Copy `source` to every matched request concurrently.
    ///
    /// `prelude` produces the bytes written to each receiver ahead of the
    /// body. A receiver that errors, or stays backed up for longer than the
    /// stall timeout, is cut off without holding back the rest. Fails only
    /// when the source breaks or every receiver failed.
    ///
    /// Receivers share one read of the source, so the body advances at the
    /// pace of the slowest receiver still inside the stall timeout. Each
    /// lane buffers [`SINK_QUEUE_DEPTH`] chunks, which absorbs short bursts.
    pub async fn stream_to<R, P>(
        &self,
        mut matched: Matched,
        source: &mut R,
        prelude: P,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        P: Fn(&DownloadRequest) -> Bytes,
    {
        let id = matched.id;
        let tickets = std::mem::take(&mut matched.tickets);
        let receivers = tickets.len();
        if receivers == 0 {
            return Err(TransferError::NotFound(id));
        }

        let stall = self.inner.stall_timeout;
        let mut lanes = Vec::with_capacity(receivers);
        let mut writers = Vec::with_capacity(receivers);
        let mut completions = Vec::with_capacity(receivers);

        for t in tickets {
            let (tx, rx) = mpsc::channel::<Bytes>(SINK_QUEUE_DEPTH);
            let head = prelude(&t.request);
            lanes.push(Some(tx));
            completions.push((t.ticket, t.waiter.done));
            writers.push(drain_into(t.waiter.sink, head, rx, stall));
        }

        let (pumped, written) = tokio::join!(pump(source, lanes, stall), join_all(writers));
        let (body, open) = pumped;

        // Queue entries go first so a released waiter never sees its own ticket.
        drop(matched);

        let mut delivered = 0usize;
        for (((ticket, done), result), still_open) in completions.into_iter().zip(written).zip(open) {
            let completion = match (&body, result) {
                (Err(e), _) => Completion::Failed(format!("upload interrupted: {e}")),
                (Ok(_), Ok(_)) if !still_open => Completion::Failed("receiver stalled".to_string()),
                (Ok(_), Ok(n)) => {
                    delivered += 1;
                    Completion::Delivered(n)
                }
                (Ok(_), Err(e)) => {
                    debug!(file = %id, ticket = ticket.0, error = %e, "receiver dropped");
                    Completion::Failed(e.to_string())
                }
            };
            let _ = done.send(completion);
        }

        match body {
            Err(e) => Err(TransferError::Source(e)),
            Ok(_) if delivered == 0 => {
                warn!(file = %id, receivers, "every receiver failed");
                Err(TransferError::AllSinksFailed(receivers))
            }
            Ok(n) => {
                debug!(file = %id, bytes = n, delivered, receivers, "upload streamed");
                Ok(n)
            }
        }
    }

    /// Refuse every request still waiting on `id`; its owner is gone.
    /// Requests already being streamed to are left to finish.
    pub fn cancel_for_owner(&self, id: FileId) -> usize {
        let cancelled = self
            .with_queue(id, |entries| {
                let mut waiters = Vec::new();
                entries.retain_mut(|p| match p.waiter.take() {
                    Some(w) => {
                        waiters.push(w);
                        false
                    }
                    None => true,
                });
                waiters
            })
            .unwrap_or_default();

        let count = cancelled.len();
        for waiter in cancelled {
            let _ = waiter.done.send(Completion::Cancelled(Refusal {
                reason: TransferError::OwnerGone(id),
                sink: waiter.sink,
            }));
        }
        if count > 0 {
            debug!(file = %id, count, "cancelled requests for departed owner");
        }
        count
    }

    /// Requests waiting or streaming for `id`
    pub fn queued(&self, id: FileId) -> usize {
        self.queue(id).map_or(0, |cell| cell.lock().entries.len())
    }

    /// Requests across all ids
    pub fn total_queued(&self) -> usize {
        self.inner
            .queues
            .read()
            .values()
            .map(|cell| cell.lock().entries.len())
            .sum()
    }

    /// Remove a still-waiting ticket, handing back its waiter. `None` when
    /// something else already settled or claimed it.
    fn claim(&self, id: FileId, ticket: TicketId) -> Option<Waiter> {
        self.with_queue(id, |entries| {
            let idx = entries
                .iter()
                .position(|p| p.ticket == ticket && p.waiter.is_some())?;
            entries.remove(idx).waiter
        })
        .flatten()
    }

    fn queue(&self, id: FileId) -> Option<QueueCell> {
        self.inner.queues.read().get(&id).cloned()
    }

    fn queue_or_insert(&self, id: FileId) -> QueueCell {
        if let Some(cell) = self.queue(id) {
            return cell;
        }
        self.inner.queues.write().entry(id).or_default().clone()
    }

    /// Drop `cell` from the map unless it was already replaced.
    fn forget(&self, id: FileId, cell: &QueueCell) {
        let mut queues = self.inner.queues.write();
        if queues.get(&id).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            queues.remove(&id);
        }
    }

    /// Run `f` on the entries for `id`, retiring the queue if it empties.
    fn with_queue<T>(&self, id: FileId, f: impl FnOnce(&mut Vec<Pending>) -> T) -> Option<T> {
        let cell = self.queue(id)?;
        let (out, emptied) = {
            let mut queue = cell.lock();
            let out = f(&mut queue.entries);
            let emptied = queue.entries.is_empty() && !queue.retired;
            if emptied {
                queue.retired = true;
            }
            (out, emptied)
        };
        if emptied {
            self.forget(id, &cell);
        }
        Some(out)
    }
}

fn settled(res: Result<Completion, oneshot::error::RecvError>) -> Completion {
    res.unwrap_or_else(|_| Completion::Failed("transfer abandoned".to_string()))
}

/// Read `source` to the end, handing each chunk to every open lane.
/// The next read waits until every open lane took the current chunk.
/// Returns the body length and which lanes stayed open throughout.
async fn pump<R>(
    source: &mut R,
    mut lanes: Vec<Option<mpsc::Sender<Bytes>>>,
    stall: Duration,
) -> (io::Result<u64>, Vec<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

    let result = loop {
        if lanes.iter().all(Option::is_none) {
            break Ok(total);
        }

        buf.reserve(CHUNK_SIZE);
        let n = match source.read_buf(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        total += n as u64;
        let chunk = buf.split().freeze();

        join_all(lanes.iter_mut().map(|lane| {
            let chunk = chunk.clone();
            async move {
                if let Some(tx) = lane {
                    if tx.send_timeout(chunk, stall).await.is_err() {
                        *lane = None;
                    }
                }
            }
        }))
        .await;
    };

    let open = lanes.iter().map(Option::is_some).collect();
    (result, open)
}

/// Write `head` and then every chunk from `rx` into `sink`, closing it after.
async fn drain_into(
    mut sink: Sink,
    head: Bytes,
    mut rx: mpsc::Receiver<Bytes>,
    stall: Duration,
) -> io::Result<u64> {
    let mut written = 0u64;
    write_within(&mut sink, &head, stall).await?;
    while let Some(chunk) = rx.recv().await {
        write_within(&mut sink, &chunk, stall).await?;
        written += chunk.len() as u64;
    }
    tokio::time::timeout(stall, sink.shutdown())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receiver stalled on close"))??;
    Ok(written)
}

async fn write_within(sink: &mut Sink, bytes: &[u8], stall: Duration) -> io::Result<()> {
    tokio::time::timeout(stall, sink.write_all(bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receiver stalled"))?
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream};

    const STALL: Duration = Duration::from_secs(2);

    /// Sink that rejects every write
    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn setup() -> (Arc<FileRegistry>, TransferBroker) {
        let registry = Arc::new(FileRegistry::new());
        registry.register(ConnId(1), FileId(7), None);
        let broker = TransferBroker::new(registry.clone(), STALL);
        (registry, broker)
    }

    fn request(range: &str) -> DownloadRequest {
        DownloadRequest {
            range: range.to_string(),
            inline: false,
        }
    }

    fn pipe() -> (Sink, DuplexStream) {
        let (a, b) = duplex(1 << 20);
        (Box::new(a), b)
    }

    async fn read_all(mut side: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        side.read_to_end(&mut out).await.unwrap();
        out
    }

    fn no_prelude(_: &DownloadRequest) -> Bytes {
        Bytes::new()
    }

    #[tokio::test]
    async fn test_park_unknown_id_is_not_found() {
        let (_registry, broker) = setup();
        let (sink, _peer) = pipe();

        let refusal = broker.park(FileId(99), request(""), sink).unwrap_err();

        assert!(matches!(refusal.reason, TransferError::NotFound(FileId(99))));
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_park_reports_owner() {
        let (_registry, broker) = setup();
        let (sink, _peer) = pipe();

        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        assert_eq!(parked.owner, ConnId(1));
        assert_eq!(broker.queued(FileId(7)), 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_ticket() {
        let (_registry, broker) = setup();
        let (sink, _peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        let completion = broker
            .wait(parked, Duration::from_millis(20), std::future::pending())
            .await;

        match completion {
            Completion::Cancelled(r) => assert!(matches!(r.reason, TransferError::Timeout(_))),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(broker.queued(FileId(7)), 0);
        // a later owner departure finds nothing left to cancel
        assert_eq!(broker.cancel_for_owner(FileId(7)), 0);
    }

    #[tokio::test]
    async fn test_hangup_withdraws_ticket() {
        let (_registry, broker) = setup();
        let (sink, _peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        let completion = broker.wait(parked, Duration::from_secs(5), async {}).await;

        match completion {
            Completion::Cancelled(r) => assert!(matches!(r.reason, TransferError::RequesterGone)),
            other => panic!("expected withdrawal, got {other:?}"),
        }
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_match_and_stream_whole_file() {
        let (_registry, broker) = setup();
        let (sink, peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .wait(parked, Duration::from_secs(5), std::future::pending())
                    .await
            })
        };
        let reader = tokio::spawn(read_all(peer));

        let matched = broker.match_tickets(FileId(7), "");
        assert_eq!(matched.len(), 1);

        let mut body: &[u8] = b"hello world";
        let sent = broker
            .stream_to(matched, &mut body, |_| Bytes::from_static(b"HEAD|"))
            .await
            .unwrap();

        assert_eq!(sent, 11);
        assert!(matches!(waiter.await.unwrap(), Completion::Delivered(11)));
        assert_eq!(reader.await.unwrap(), b"HEAD|hello world");
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_range_tokens_do_not_cross() {
        let (_registry, broker) = setup();
        let (low_sink, low_peer) = pipe();
        let (high_sink, high_peer) = pipe();
        let low = broker.park(FileId(7), request("bytes=0-99"), low_sink).unwrap();
        let high = broker
            .park(FileId(7), request("bytes=100-199"), high_sink)
            .unwrap();

        let matched = broker.match_tickets(FileId(7), "bytes=0-99");
        assert_eq!(matched.tickets().collect::<Vec<_>>(), vec![low.ticket]);

        let mut body: &[u8] = b"low";
        broker.stream_to(matched, &mut body, no_prelude).await.unwrap();

        assert!(matches!(
            broker.wait(low, STALL, std::future::pending()).await,
            Completion::Delivered(3)
        ));
        assert_eq!(read_all(low_peer).await, b"low");

        // the other range is still parked and untouched
        assert_eq!(broker.queued(FileId(7)), 1);
        assert!(broker.match_tickets(FileId(7), "bytes=0-99").is_empty());

        let matched = broker.match_tickets(FileId(7), "bytes=100-199");
        let mut body: &[u8] = b"high";
        broker.stream_to(matched, &mut body, no_prelude).await.unwrap();
        assert!(matches!(
            broker.wait(high, STALL, std::future::pending()).await,
            Completion::Delivered(4)
        ));
        assert_eq!(read_all(high_peer).await, b"high");
    }

    #[tokio::test]
    async fn test_identical_requests_all_served() {
        let (_registry, broker) = setup();
        let mut parked = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (sink, peer) = pipe();
            parked.push(broker.park(FileId(7), request("bytes=0-"), sink).unwrap());
            peers.push(tokio::spawn(read_all(peer)));
        }

        let matched = broker.match_tickets(FileId(7), "bytes=0-");
        let order: Vec<_> = matched.tickets().collect();
        assert_eq!(order, parked.iter().map(|p| p.ticket).collect::<Vec<_>>());

        let mut body: &[u8] = b"same bytes";
        broker.stream_to(matched, &mut body, no_prelude).await.unwrap();

        for p in parked {
            assert!(matches!(
                broker.wait(p, STALL, std::future::pending()).await,
                Completion::Delivered(10)
            ));
        }
        for peer in peers {
            assert_eq!(peer.await.unwrap(), b"same bytes");
        }
    }

    #[tokio::test]
    async fn test_one_broken_sink_does_not_stop_others() {
        let (_registry, broker) = setup();
        let broken = broker
            .park(FileId(7), request(""), Box::new(BrokenSink))
            .unwrap();
        let (sink_a, peer_a) = pipe();
        let (sink_b, peer_b) = pipe();
        let a = broker.park(FileId(7), request(""), sink_a).unwrap();
        let b = broker.park(FileId(7), request(""), sink_b).unwrap();
        let readers = (tokio::spawn(read_all(peer_a)), tokio::spawn(read_all(peer_b)));

        let payload = vec![0xAB; CHUNK_SIZE * 3 + 17];
        let mut body: &[u8] = &payload;
        let matched = broker.match_tickets(FileId(7), "");
        let sent = broker.stream_to(matched, &mut body, no_prelude).await.unwrap();

        assert_eq!(sent, payload.len() as u64);
        assert!(matches!(
            broker.wait(broken, STALL, std::future::pending()).await,
            Completion::Failed(_)
        ));
        for p in [a, b] {
            assert!(matches!(
                broker.wait(p, STALL, std::future::pending()).await,
                Completion::Delivered(n) if n == payload.len() as u64
            ));
        }
        assert_eq!(readers.0.await.unwrap(), payload);
        assert_eq!(readers.1.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_all_sinks_failed() {
        let (_registry, broker) = setup();
        let first = broker
            .park(FileId(7), request(""), Box::new(BrokenSink))
            .unwrap();
        let second = broker
            .park(FileId(7), request(""), Box::new(BrokenSink))
            .unwrap();

        let mut body: &[u8] = b"nobody listens";
        let matched = broker.match_tickets(FileId(7), "");
        let err = broker.stream_to(matched, &mut body, no_prelude).await.unwrap_err();

        assert!(matches!(err, TransferError::AllSinksFailed(2)));
        for p in [first, second] {
            assert!(matches!(
                broker.wait(p, STALL, std::future::pending()).await,
                Completion::Failed(_)
            ));
        }
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_cancel_for_owner_refuses_waiters() {
        let (registry, broker) = setup();
        let (sink, _peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        registry.release_all(ConnId(1));
        assert_eq!(broker.cancel_for_owner(FileId(7)), 1);

        match broker.wait(parked, STALL, std::future::pending()).await {
            Completion::Cancelled(r) => {
                assert!(matches!(r.reason, TransferError::OwnerGone(FileId(7))))
            }
            other => panic!("expected owner gone, got {other:?}"),
        }
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_cancel_skips_tickets_being_streamed() {
        let (_registry, broker) = setup();
        let (sink, peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        let matched = broker.match_tickets(FileId(7), "");
        // owner leaves while the upload is in flight
        assert_eq!(broker.cancel_for_owner(FileId(7)), 0);
        assert_eq!(broker.queued(FileId(7)), 1);

        let reader = tokio::spawn(read_all(peer));
        let mut body: &[u8] = b"late but whole";
        broker.stream_to(matched, &mut body, no_prelude).await.unwrap();

        assert!(matches!(
            broker.wait(parked, STALL, std::future::pending()).await,
            Completion::Delivered(14)
        ));
        assert_eq!(reader.await.unwrap(), b"late but whole");
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_matched_ticket_ignores_deadline() {
        let (_registry, broker) = setup();
        let (sink, peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();
        let matched = broker.match_tickets(FileId(7), "");

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .wait(parked, Duration::from_millis(10), std::future::pending())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reader = tokio::spawn(read_all(peer));
        let mut body: &[u8] = b"slow start";
        broker.stream_to(matched, &mut body, no_prelude).await.unwrap();

        assert!(matches!(waiter.await.unwrap(), Completion::Delivered(10)));
        assert_eq!(reader.await.unwrap(), b"slow start");
    }

    #[tokio::test]
    async fn test_dropped_match_releases_waiters() {
        let (_registry, broker) = setup();
        let (sink, _peer) = pipe();
        let parked = broker.park(FileId(7), request(""), sink).unwrap();

        drop(broker.match_tickets(FileId(7), ""));

        assert!(matches!(
            broker.wait(parked, STALL, std::future::pending()).await,
            Completion::Failed(_)
        ));
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test]
    async fn test_park_after_owner_left_is_not_found() {
        let (registry, broker) = setup();
        registry.release_all(ConnId(1));
        let (sink, _peer) = pipe();

        let refusal = broker.park(FileId(7), request(""), sink).unwrap_err();

        assert!(matches!(refusal.reason, TransferError::NotFound(_)));
        assert_eq!(broker.total_queued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_timeout_and_cancel_settle_once() {
        let (_registry, broker) = setup();
        let mut waits = Vec::new();
        for _ in 0..50 {
            let (sink, _peer) = pipe();
            let parked = broker.park(FileId(7), request(""), sink).unwrap();
            let broker = broker.clone();
            waits.push(tokio::spawn(async move {
                broker
                    .wait(parked, Duration::from_millis(5), std::future::pending())
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        let cancelled = broker.cancel_for_owner(FileId(7));

        let mut timed_out = 0;
        let mut gone = 0;
        for w in waits {
            match w.await.unwrap() {
                Completion::Cancelled(r) => match r.reason {
                    TransferError::Timeout(_) => timed_out += 1,
                    TransferError::OwnerGone(_) => gone += 1,
                    other => panic!("unexpected {other}"),
                },
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(gone, cancelled);
        assert_eq!(timed_out + gone, 50);
        assert_eq!(broker.total_queued(), 0);
    }
}
