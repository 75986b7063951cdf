//! Routing for duplex-channel peers: join, inbound frames, departure.

use bytes::Bytes;
use tracing::{debug, info};

use super::hub::Subscription;
use super::{ConnId, Relay};
use crate::protocol::{self, ClearFile, FileId, FrameError, InboundFrame, MessageType};

/// A joined duplex-channel connection
#[derive(Debug)]
pub struct Peer {
    pub conn: ConnId,
    /// Display name stamped on everything this peer sends
    pub name: String,
}

impl Relay {
    /// Register a new connection: it joins the live set and receives the
    /// history snapshot taken at the same instant.
    pub fn join(&self, name: impl Into<String>) -> (Peer, Subscription) {
        let conn = self.next_conn_id();
        let name = protocol::truncate_name(&name.into()).to_string();
        let subscription = self.hub().subscribe_with_snapshot(conn);
        info!(conn = %conn, name = %name, replay = subscription.history.len(), "peer joined");
        (Peer { conn, name }, subscription)
    }

    /// Stamp and broadcast one frame received from `peer`.
    ///
    /// File announcements are also registered so downloads can find their
    /// owner. A decode error is the caller's cue to end the session.
    pub fn dispatch(&self, peer: &Peer, raw: Bytes) -> Result<MessageType, FrameError> {
        let frame = InboundFrame::decode(raw)?;
        let stamped = protocol::broadcast_frame(
            frame.kind,
            &peer.name,
            protocol::now_millis(),
            &frame.payload,
        );
        let file_id = frame.file_id();
        let mut replaced = None;
        // A file becomes downloadable before anyone can see it announced.
        let published = self.hub().publish_with(stamped, true, |handle| {
            if let Some(id) = file_id {
                replaced = self.registry().register(peer.conn, id, handle);
            }
        });
        // A re-announced id keeps only its latest announcement in history.
        if let Some(stale) = replaced.and_then(|r| r.history) {
            self.hub().remove_history_entry(stale);
        }

        if let Some(id) = file_id {
            debug!(
                conn = %peer.conn,
                file = %id,
                name = frame.file_meta().map(|m| m.name).unwrap_or_default(),
                "file announced"
            );
        } else {
            debug!(conn = %peer.conn, kind = ?frame.kind, bytes = frame.payload.len(), "message relayed");
        }
        if !published.unreachable.is_empty() {
            debug!(unreachable = ?published.unreachable, "subscribers already closing");
        }
        Ok(frame.kind)
    }

    /// Tear down a departed connection.
    ///
    /// Order matters: leave the live set, release its files, refuse requests
    /// parked on them, tell everyone the files are gone, then drop their
    /// announcements from history. Returns the released ids.
    pub fn leave(&self, peer: Peer) -> Vec<FileId> {
        self.hub().unsubscribe(peer.conn);

        let released = self.registry().release_all(peer.conn);
        let ids: Vec<FileId> = released.iter().map(|(id, _)| *id).collect();

        let refused: usize = ids.iter().map(|id| self.broker().cancel_for_owner(*id)).sum();

        let notice = ClearFile { ids: ids.clone() };
        self.hub().publish(notice.encode(), false);
        for handle in released.into_iter().filter_map(|(_, h)| h) {
            self.hub().remove_history_entry(handle);
        }

        info!(conn = %peer.conn, name = %peer.name, files = ids.len(), refused, "peer left");
        ids
    }
}
