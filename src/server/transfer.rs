//! Download and upload endpoints.
//!
//! A download parks its socket's write half with the broker and waits; the
//! owner's upload is then streamed straight into it, response head first.

use anyhow::Result;
use bytes::Bytes;
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::http::{text_response, RequestHead, ResponseHead};
use crate::protocol::FileId;
use crate::relay::{Completion, DownloadRequest, Refusal, Relay, TransferError};

const DEFAULT_MIME: &str = "application/octet-stream";

/// `GET /download/<id>`
pub async fn download(stream: TcpStream, head: &RequestHead, id: FileId, relay: &Relay) -> Result<()> {
    let request = DownloadRequest {
        range: head.header("range").unwrap_or_default().to_string(),
        inline: head.has_query("open"),
    };
    let (mut reader, writer) = stream.into_split();

    let parked = match relay.request_file(id, request, Box::new(writer)) {
        Ok(parked) => parked,
        Err(refusal) => return refuse(id, refusal).await,
    };

    // The requester sends nothing more; EOF or an error means it left.
    let hangup = async move {
        let mut scratch = [0u8; 256];
        while matches!(reader.read(&mut scratch).await, Ok(n) if n > 0) {}
    };

    match relay.await_file(parked, hangup).await {
        Completion::Delivered(bytes) => {
            info!(file = %id, bytes, "download served");
            Ok(())
        }
        Completion::Failed(reason) => {
            debug!(file = %id, %reason, "download cut short");
            Ok(())
        }
        Completion::Cancelled(refusal) => refuse(id, refusal).await,
    }
}

/// Answer a download the broker gave back unserved.
async fn refuse(id: FileId, refusal: Refusal) -> Result<()> {
    let Refusal { reason, mut sink } = refusal;
    let reply = match &reason {
        TransferError::NotFound(_) | TransferError::OwnerGone(_) => text_response(404, "404 page not found\n"),
        TransferError::Timeout(_) => text_response(408, "Request Timeout\n"),
        TransferError::RequesterGone => {
            debug!(file = %id, "requester left before upload");
            return Ok(());
        }
        other => text_response(500, &format!("{other}\n")),
    };
    debug!(file = %id, %reason, "download refused");
    sink.write_all(&reply).await?;
    sink.shutdown().await?;
    Ok(())
}

/// Response details an upload supplies for its matched downloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    /// Token echoed from the RequestFile signal
    pub range: String,
    pub name: String,
    pub mime: String,
    pub size: Option<u64>,
    pub content_range: Option<String>,
}

impl UploadMeta {
    pub fn from_request(head: &RequestHead, id: FileId) -> Self {
        let name = head
            .query_param("name")
            .filter(|n| !n.is_empty())
            .map(|n| n.replace('"', "\\\""))
            .unwrap_or_else(|| id.to_string());
        let mime = head
            .query_param("type")
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_MIME)
            .to_string();

        Self {
            range: head.query_param("range").unwrap_or_default().to_string(),
            name,
            mime,
            size: head.query_param("size").and_then(|s| s.parse().ok()),
            content_range: head
                .header("content-range")
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        }
    }

    /// Response head written to one matched download. Always 206: every
    /// relayed body is the slice the owner chose to send.
    pub fn prelude(&self, request: &DownloadRequest) -> Bytes {
        let disposition = if request.inline { "inline" } else { "attachment" };

        ResponseHead::new(206)
            .header("Content-Type", &self.mime)
            .header(
                "Content-Disposition",
                format!("{disposition}; filename=\"{}\"", self.name),
            )
            .header_opt("Content-Length", self.size.map(|s| s.to_string()))
            .header_opt("Content-Range", self.content_range.as_deref())
            .encode()
    }
}

/// `POST /upload/<id>`
pub async fn upload(
    mut stream: TcpStream,
    head: &RequestHead,
    leftover: Bytes,
    id: FileId,
    relay: &Relay,
) -> Result<()> {
    if head.is_chunked() {
        stream
            .write_all(&text_response(411, "Content-Length required\n"))
            .await?;
        return Ok(());
    }
    let length = match head.content_length() {
        Ok(length) => length.unwrap_or(0),
        Err(e) => {
            stream.write_all(&text_response(400, &format!("{e}\n"))).await?;
            return Ok(());
        }
    };

    let meta = UploadMeta::from_request(head, id);
    let matched = relay.offer_file(id, &meta.range);
    if matched.is_empty() {
        debug!(file = %id, range = %meta.range, "upload matched no request");
        stream.write_all(&text_response(404, "404 page not found\n")).await?;
        return Ok(());
    }
    debug!(file = %id, range = %meta.range, receivers = matched.len(), length, "upload started");

    let result = {
        let mut body = Cursor::new(leftover).chain(&mut stream).take(length);
        relay
            .deliver(matched, &mut body, |request| meta.prelude(request))
            .await
    };

    let reply = match result {
        Ok(n) if n < length => {
            warn!(file = %id, got = n, expected = length, "upload body ended early");
            text_response(400, "upload body ended early\n")
        }
        Ok(n) => {
            info!(file = %id, bytes = n, name = %meta.name, "upload relayed");
            text_response(200, &n.to_string())
        }
        Err(TransferError::AllSinksFailed(n)) => {
            text_response(502, &format!("all {n} receivers failed\n"))
        }
        Err(TransferError::Source(e)) => {
            debug!(file = %id, error = %e, "upload body failed");
            return Ok(());
        }
        Err(e) => text_response(404, &format!("{e}\n")),
    };
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(())
}
