//! Network front end: one TCP listener serving the page, the id and
//! transfer endpoints, and the WebSocket channel.
//!
//! Each accepted connection runs in its own task and carries exactly one
//! request (responses close the connection). Shutdown stops accepting,
//! tells open sessions to close, and gives everything [`DRAIN_TIMEOUT`] to
//! finish before the remaining tasks are aborted.

pub mod http;
pub mod transfer;
pub mod ws;

use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::protocol::FileId;
use crate::relay::Relay;
use http::{text_response, HttpError};

/// Time allowed for a client to send its request head
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for in-flight connections on shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-message size ceiling on the WebSocket channel
pub const DEFAULT_MESSAGE_LIMIT: usize = 16 * 1024 * 1024;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

const INDEX_CSP: &str = "default-src 'none'; connect-src 'self'; img-src blob:; \
                         script-src 'unsafe-inline'; style-src 'unsafe-inline'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    pub bind: String,
    /// Largest single WebSocket message accepted
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "[::]:8080".to_string(),
            max_message_size: DEFAULT_MESSAGE_LIMIT,
        }
    }
}

/// Endpoint a request resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    NewId,
    Upload(FileId),
    Download(FileId),
    WebSocket,
    MethodNotAllowed,
    NotFound,
}

impl Route {
    pub fn parse(method: &str, path: &str) -> Self {
        if path == "/" || path.starts_with("/index.") {
            return Route::Index;
        }
        if path == "/id" {
            return Route::NewId;
        }
        if path == "/ws" {
            return Route::WebSocket;
        }
        if let Some(rest) = path.strip_prefix("/upload/") {
            if method != "POST" {
                return Route::MethodNotAllowed;
            }
            return parse_id(rest).map_or(Route::NotFound, Route::Upload);
        }
        if let Some(rest) = path.strip_prefix("/download/") {
            return parse_id(rest).map_or(Route::NotFound, Route::Download);
        }
        Route::NotFound
    }
}

/// Decimal id occupying the whole segment
fn parse_id(segment: &str) -> Option<FileId> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

#[derive(Serialize)]
struct IdResponse {
    id: u32,
}

pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(settings: Settings) -> Result<Self> {
        let listener = TcpListener::bind(&settings.server.bind)
            .await
            .with_context(|| format!("failed to listen on {}", settings.server.bind))?;
        Ok(Self {
            listener,
            relay: Arc::new(Relay::new(settings.relay)),
            config: settings.server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Serve until `shutdown` resolves, then drain.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let relay = self.relay.clone();
                        let config = self.config.clone();
                        let stop = stop_rx.clone();
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, remote, &relay, &config, stop).await {
                                debug!(%remote, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        drop(self.listener);
        info!(connections = tasks.len(), "shutting down");
        let _ = stop_tx.send(true);

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(remaining = tasks.len(), "drain timed out, aborting connections");
            tasks.shutdown().await;
        }

        let stats = self.relay.stats();
        info!(
            history = stats.history,
            files = stats.files,
            queued = stats.queued,
            "server stopped"
        );
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    relay: &Relay,
    config: &ServerConfig,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let (head, leftover) = match tokio::time::timeout(READ_TIMEOUT, http::read_head(&mut stream)).await {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(HttpError::Closed)) => return Ok(()),
        Ok(Err(HttpError::HeadTooLarge)) => {
            stream.write_all(&text_response(431, "request head too large\n")).await?;
            return Ok(());
        }
        Ok(Err(e)) => {
            stream.write_all(&text_response(400, &format!("{e}\n"))).await?;
            return Ok(());
        }
        Err(_) => {
            debug!(%remote, "request head timed out");
            return Ok(());
        }
    };

    let route = Route::parse(&head.method, &head.path);
    debug!(%remote, method = %head.method, path = %head.path, ?route, "request");

    match route {
        Route::Index => {
            let reply = http::ResponseHead::new(200)
                .header("Content-Type", "text/html; charset=utf-8")
                .header("Content-Security-Policy", INDEX_CSP)
                .header("Content-Length", INDEX_HTML.len().to_string())
                .encode();
            stream.write_all(&reply).await?;
            if head.method != "HEAD" {
                stream.write_all(INDEX_HTML.as_bytes()).await?;
            }
        }
        Route::NewId => {
            let id = relay.next_file_id();
            stream
                .write_all(&http::json_response(200, &IdResponse { id: id.0 }))
                .await?;
        }
        Route::Upload(id) => return transfer::upload(stream, &head, leftover, id, relay).await,
        Route::Download(id) => return transfer::download(stream, &head, id, relay).await,
        Route::WebSocket => {
            return ws::serve(stream, &head, leftover, remote, relay, config.max_message_size, stop).await
        }
        Route::MethodNotAllowed => {
            stream.write_all(&text_response(405, "only support POST\n")).await?;
        }
        Route::NotFound => {
            stream.write_all(&text_response(404, "404 page not found\n")).await?;
        }
    }
    stream.shutdown().await?;
    Ok(())
}
