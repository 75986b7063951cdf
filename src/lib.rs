//! lanshare - a LAN relay for chat, images and peer-to-peer file hand-off.
//!
//! Browsers connect over one WebSocket channel to broadcast messages and
//! file announcements. Downloads are parked until the announcing browser
//! uploads the bytes, which are streamed straight through to every waiting
//! requester; nothing is stored on the server.

pub mod config;
pub mod protocol;
pub mod relay;
pub mod server;

pub use config::{Cli, Settings};
pub use relay::{Relay, RelayConfig};
pub use server::{Server, ServerConfig};
