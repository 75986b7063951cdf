//! Broadcast hub: live subscriber set plus bounded history.
//!
//! Subscribers are reached through per-connection outboxes; the connection's
//! own task drains its outbox onto the socket, so `publish` never waits on a
//! slow peer. History append, eviction and delivery happen under one write
//! lock, which is also what `subscribe_with_snapshot` takes. A joining
//! connection therefore sees every frame exactly once: either in its
//! snapshot or through its outbox, never both.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

use super::ConnId;

/// Frames queued for one subscriber
pub type Outbox = mpsc::UnboundedSender<Bytes>;

/// Receiving end of a subscriber's outbox
pub type Inbox = mpsc::UnboundedReceiver<Bytes>;

/// Position of a recorded frame in the history.
///
/// Handles are issued in insertion order and never reused; a handle whose
/// entry has been evicted simply no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryHandle(u64);

#[derive(Debug)]
struct HistoryEntry {
    seq: u64,
    frame: Bytes,
}

#[derive(Debug, Default)]
struct HubState {
    subscribers: HashMap<ConnId, Outbox>,
    history: VecDeque<HistoryEntry>,
    next_seq: u64,
}

/// A connection's membership in the live set.
#[derive(Debug)]
pub struct Subscription {
    pub conn: ConnId,
    /// History as it stood at the instant of joining, oldest first
    pub history: Vec<Bytes>,
    /// Every frame published after joining
    pub inbox: Inbox,
}

/// Result of a publish call
#[derive(Debug, Default)]
pub struct Published {
    /// Handle of the recorded entry, when recording was requested
    pub handle: Option<HistoryHandle>,
    /// Subscribers whose outbox was already closed
    pub unreachable: Vec<ConnId>,
}

#[derive(Debug)]
pub struct BroadcastHub {
    max_history: usize,
    state: RwLock<HubState>,
}

impl BroadcastHub {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            state: RwLock::new(HubState::default()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Join the live set and take the history snapshot as one step.
    pub fn subscribe_with_snapshot(&self, conn: ConnId) -> Subscription {
        let (tx, inbox) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let history = state.history.iter().map(|e| e.frame.clone()).collect();
        state.subscribers.insert(conn, tx);
        Subscription {
            conn,
            history,
            inbox,
        }
    }

    /// Join the live set without a history snapshot.
    pub fn subscribe(&self, conn: ConnId) -> Inbox {
        let (tx, inbox) = mpsc::unbounded_channel();
        self.state.write().subscribers.insert(conn, tx);
        inbox
    }

    /// Leave the live set. Returns whether the connection was a member.
    pub fn unsubscribe(&self, conn: ConnId) -> bool {
        self.state.write().subscribers.remove(&conn).is_some()
    }

    /// Deliver `frame` to every subscriber, recording it first when asked.
    pub fn publish(&self, frame: Bytes, record: bool) -> Published {
        self.publish_with(frame, record, |_| ())
    }

    /// Like [`publish`](Self::publish), running `before_delivery` with the
    /// new entry's handle before any subscriber can see the frame.
    pub fn publish_with<F>(&self, frame: Bytes, record: bool, before_delivery: F) -> Published
    where
        F: FnOnce(Option<HistoryHandle>),
    {
        let mut state = self.state.write();

        let handle = if record {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.history.push_back(HistoryEntry {
                seq,
                frame: frame.clone(),
            });
            while state.history.len() > self.max_history {
                state.history.pop_front();
            }
            Some(HistoryHandle(seq))
        } else {
            None
        };
        before_delivery(handle);

        let unreachable = state
            .subscribers
            .iter()
            .filter(|(_, outbox)| outbox.send(frame.clone()).is_err())
            .map(|(conn, _)| *conn)
            .collect();

        Published {
            handle,
            unreachable,
        }
    }

    /// Send a frame to one subscriber only, without recording it.
    pub fn send_to(&self, conn: ConnId, frame: Bytes) -> bool {
        self.state
            .read()
            .subscribers
            .get(&conn)
            .is_some_and(|outbox| outbox.send(frame).is_ok())
    }

    pub fn snapshot_history(&self) -> Vec<Bytes> {
        self.state
            .read()
            .history
            .iter()
            .map(|e| e.frame.clone())
            .collect()
    }

    /// Drop one recorded entry, keeping the order of the rest.
    pub fn remove_history_entry(&self, handle: HistoryHandle) -> bool {
        let mut state = self.state.write();
        match state.history.binary_search_by_key(&handle.0, |e| e.seq) {
            Ok(idx) => state.history.remove(idx).is_some(),
            Err(_) => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
