//! Wire format for the duplex channel.
//!
//! Every subscriber receives canonical broadcast frames; the relay rebuilds
//! them from what clients send, injecting the sender name and a timestamp.
//! Two frame kinds are server-generated and never accepted from a client:
//! ClearFile (broadcast) and RequestFile (sent to a single owner).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

// Wire format: all multi-byte integers are big-endian, unsigned.
//
// Canonical frame: type:u8 | name_len:u8 | name | timestamp_ms:u64 | payload
// ClearFile:       type:u8 | id:u32 *
// RequestFile:     type:u8 | id:u32 | range token (rest of frame)

/// Longest sender name the frame header can carry
pub const NAME_LEN_MAX: usize = u8::MAX as usize;

/// Size of an encoded file identifier
pub const FILE_ID_LEN: usize = 4;

/// Size of an encoded send timestamp
pub const TIMESTAMP_LEN: usize = 8;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Text = 0,
    Image = 1,
    File = 2,
    ClearFile = 3,
    RequestFile = 4,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Text),
            1 => Some(Self::Image),
            2 => Some(Self::File),
            3 => Some(Self::ClearFile),
            4 => Some(Self::RequestFile),
            _ => None,
        }
    }

    /// Types a connected peer is allowed to send.
    pub fn is_client_originated(self) -> bool {
        matches!(self, Self::Text | Self::Image | Self::File)
    }
}

// =============================================================================
// File identifiers
// =============================================================================

/// Opaque identifier for an announced file, allocated by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    pub fn to_be_bytes(self) -> [u8; FILE_ID_LEN] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(FileId)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("{0:?} frames are generated by the server only")]
    ServerOnly(MessageType),

    #[error("{kind:?} frame truncated: expected at least {expected} bytes, got {got}")]
    Truncated {
        kind: MessageType,
        expected: usize,
        got: usize,
    },
}

// =============================================================================
// Inbound frames (client -> relay)
// =============================================================================

/// A validated frame as sent by a peer, before the relay stamps it.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub kind: MessageType,
    /// Everything after the type byte
    pub payload: Bytes,
}

impl InboundFrame {
    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        if !frame.has_remaining() {
            return Err(FrameError::Empty);
        }
        let raw = frame.get_u8();
        let kind = MessageType::from_u8(raw).ok_or(FrameError::UnknownType(raw))?;
        if !kind.is_client_originated() {
            return Err(FrameError::ServerOnly(kind));
        }

        match kind {
            MessageType::File if frame.remaining() < FILE_ID_LEN => {
                return Err(FrameError::Truncated {
                    kind,
                    expected: FILE_ID_LEN,
                    got: frame.remaining(),
                });
            }
            MessageType::Image => {
                let subtype_len = frame.first().copied().unwrap_or(0) as usize;
                if frame.remaining() < 1 + subtype_len {
                    return Err(FrameError::Truncated {
                        kind,
                        expected: 1 + subtype_len,
                        got: frame.remaining(),
                    });
                }
            }
            _ => {}
        }

        Ok(Self {
            kind,
            payload: frame,
        })
    }

    /// Identifier embedded in a File announcement.
    pub fn file_id(&self) -> Option<FileId> {
        if self.kind != MessageType::File || self.payload.len() < FILE_ID_LEN {
            return None;
        }
        let mut id = &self.payload[..FILE_ID_LEN];
        Some(FileId(id.get_u32()))
    }

    /// Metadata of a File announcement, if it parses.
    pub fn file_meta(&self) -> Option<FileMeta> {
        if self.kind != MessageType::File {
            return None;
        }
        FileMeta::parse(self.payload.get(FILE_ID_LEN..)?).ok()
    }
}

// =============================================================================
// Canonical broadcast frame
// =============================================================================

/// Cut `name` to at most [`NAME_LEN_MAX`] bytes without splitting a character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= NAME_LEN_MAX {
        return name;
    }
    let mut end = NAME_LEN_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Build the frame every subscriber receives.
pub fn broadcast_frame(kind: MessageType, sender: &str, timestamp_ms: u64, payload: &[u8]) -> Bytes {
    let name = truncate_name(sender).as_bytes();
    let mut buf = BytesMut::with_capacity(2 + name.len() + TIMESTAMP_LEN + payload.len());

    buf.put_u8(kind as u8);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_u64(timestamp_ms);
    buf.put_slice(payload);

    buf.freeze()
}

/// Decoded view of a canonical broadcast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFrame {
    pub kind: MessageType,
    pub sender: String,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl BroadcastFrame {
    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        if !frame.has_remaining() {
            return Err(FrameError::Empty);
        }
        let raw = frame.get_u8();
        let kind = MessageType::from_u8(raw).ok_or(FrameError::UnknownType(raw))?;
        if !kind.is_client_originated() {
            return Err(FrameError::ServerOnly(kind));
        }
        if !frame.has_remaining() {
            return Err(FrameError::Truncated {
                kind,
                expected: 1,
                got: 0,
            });
        }
        let name_len = frame.get_u8() as usize;
        if frame.remaining() < name_len + TIMESTAMP_LEN {
            return Err(FrameError::Truncated {
                kind,
                expected: name_len + TIMESTAMP_LEN,
                got: frame.remaining(),
            });
        }
        let sender = String::from_utf8_lossy(&frame.copy_to_bytes(name_len)).into_owned();
        let timestamp_ms = frame.get_u64();

        Ok(Self {
            kind,
            sender,
            timestamp_ms,
            payload: frame,
        })
    }
}

// =============================================================================
// CLEAR_FILE (3)
// =============================================================================

/// Notice that the listed files are no longer available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearFile {
    pub ids: Vec<FileId>,
}

impl ClearFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.ids.len() * FILE_ID_LEN);
        buf.put_u8(MessageType::ClearFile as u8);
        for id in &self.ids {
            buf.put_u32(id.0);
        }
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        match frame.first().copied() {
            None => return Err(FrameError::Empty),
            Some(b) if b != MessageType::ClearFile as u8 => {
                return Err(FrameError::UnknownType(b));
            }
            Some(_) => frame.advance(1),
        }
        if frame.remaining() % FILE_ID_LEN != 0 {
            return Err(FrameError::Truncated {
                kind: MessageType::ClearFile,
                expected: (frame.remaining() / FILE_ID_LEN + 1) * FILE_ID_LEN,
                got: frame.remaining(),
            });
        }
        let mut ids = Vec::with_capacity(frame.remaining() / FILE_ID_LEN);
        while frame.has_remaining() {
            ids.push(FileId(frame.get_u32()));
        }
        Ok(Self { ids })
    }
}

// =============================================================================
// REQUEST_FILE (4)
// =============================================================================

/// Signal asking the owner of `id` to upload the bytes described by `range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFile {
    pub id: FileId,
    /// Opaque correlation token, empty for the whole file
    pub range: String,
}

impl RequestFile {
    pub fn encode(&self) -> Bytes {
        let range = self.range.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + FILE_ID_LEN + range.len());
        buf.put_u8(MessageType::RequestFile as u8);
        buf.put_u32(self.id.0);
        buf.put_slice(range);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, FrameError> {
        match frame.first().copied() {
            None => return Err(FrameError::Empty),
            Some(b) if b != MessageType::RequestFile as u8 => {
                return Err(FrameError::UnknownType(b));
            }
            Some(_) => frame.advance(1),
        }
        if frame.remaining() < FILE_ID_LEN {
            return Err(FrameError::Truncated {
                kind: MessageType::RequestFile,
                expected: FILE_ID_LEN,
                got: frame.remaining(),
            });
        }
        let id = FileId(frame.get_u32());
        let range = String::from_utf8_lossy(&frame).into_owned();
        Ok(Self { id, range })
    }
}

// =============================================================================
// File metadata
// =============================================================================

/// Textual metadata carried after the id of a File announcement.
///
/// The relay forwards it untouched; this view is for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    /// Last modification, milliseconds since epoch
    pub updated: i64,
}

impl FileMeta {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// Tests
// =============================================================================
