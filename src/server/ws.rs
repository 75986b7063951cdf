//! Duplex-channel endpoint over WebSocket.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::http::{text_response, RequestHead, ResponseHead};
use crate::relay::{Peer, Relay, Subscription};

/// How long one outbound frame may take to reach the peer
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// `Sec-WebSocket-Key` of a valid upgrade request
pub fn upgrade_key(head: &RequestHead) -> Option<&str> {
    let upgrade = head
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if head.method != "GET" || !upgrade || !head.header_has_token("connection", "upgrade") {
        return None;
    }
    head.header("sec-websocket-key").filter(|k| !k.is_empty())
}

/// `GET /ws[?name=...]`
pub async fn serve(
    mut stream: TcpStream,
    head: &RequestHead,
    leftover: Bytes,
    remote: SocketAddr,
    relay: &Relay,
    max_message_size: usize,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let Some(key) = upgrade_key(head) else {
        stream
            .write_all(&text_response(400, "expected a websocket upgrade\n"))
            .await?;
        return Ok(());
    };

    let accept = ResponseHead::new(101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()))
        .encode();
    stream.write_all(&accept).await.context("websocket handshake")?;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    let ws = WebSocketStream::from_partially_read(stream, leftover.to_vec(), Role::Server, Some(config)).await;

    let name = head
        .query_param("name")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote.to_string());

    let (peer, subscription) = relay.join(name);
    let result = session(ws, relay, &peer, subscription, stop).await;
    relay.leave(peer);
    result
}

async fn session(
    ws: WebSocketStream<TcpStream>,
    relay: &Relay,
    peer: &Peer,
    subscription: Subscription,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let Subscription {
        history, mut inbox, ..
    } = subscription;
    let (mut outbound, mut inbound) = ws.split();

    for frame in history {
        send_frame(&mut outbound, frame).await?;
    }

    if *stop.borrow() {
        return Ok(());
    }

    loop {
        tokio::select! {
            message = inbound.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = relay.dispatch(peer, Bytes::from(data)) {
                        warn!(conn = %peer.conn, error = %e, "bad frame, closing session");
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    debug!(conn = %peer.conn, "ignoring text message");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %peer.conn, error = %e, "websocket read failed");
                    break;
                }
            },
            frame = inbox.recv() => match frame {
                Some(frame) => send_frame(&mut outbound, frame).await?,
                None => break,
            },
            _ = stop.changed() => {
                let _ = outbound.send(Message::Close(None)).await;
                break;
            }
        }
    }
    Ok(())
}

async fn send_frame<S>(outbound: &mut S, frame: Bytes) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    tokio::time::timeout(WRITE_TIMEOUT, outbound.send(Message::Binary(frame.to_vec())))
        .await
        .context("websocket write timed out")?
        .context("websocket write failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http::parse_head;

    #[test]
    fn test_upgrade_key() {
        let head = parse_head(
            b"GET /ws?name=bob HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
        assert_eq!(upgrade_key(&head), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_key_requires_upgrade_headers() {
        let plain = parse_head(b"GET /ws HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n").unwrap();
        assert_eq!(upgrade_key(&plain), None);

        let post = parse_head(
            b"POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: abc\r\n\r\n",
        )
        .unwrap();
        assert_eq!(upgrade_key(&post), None);
    }
}
