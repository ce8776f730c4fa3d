//! Raw socket plumbing around the WebSocket upgrade
//!
//! The WebSocket library only answers upgrade requests. To answer plain
//! HTTP requests with `400`, the accept path reads the request head first,
//! decides, and then hands the bytes back to the handshake through
//! `PrefixedStream`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::error::ValidationError;

/// Cookie carrying the client's self-reported identity
pub const IDENTITY_COOKIE: &str = "ClientName";

/// Status description sent to non-upgrade requests
pub const NOT_WEBSOCKET_REASON: &str = "not websocket request";

/// Status description sent to upgrade requests missing handshake headers
pub const INVALID_HANDSHAKE_REASON: &str = "invalid websocket handshake";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Read from `stream` until the end of the HTTP request head.
///
/// Returns every byte read, which may run past the head. Fails with
/// `InvalidData` when the head exceeds `limit` and `UnexpectedEof` when
/// the peer hangs up first.
pub async fn read_request_head<S>(stream: &mut S, limit: usize) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head completed",
            ));
        }
        head.extend_from_slice(&chunk[..n]);

        if head.windows(HEAD_TERMINATOR.len()).any(|w| w == HEAD_TERMINATOR) {
            return Ok(head);
        }
        if head.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Whether a request head asks for a WebSocket upgrade
pub fn is_upgrade_request(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    has_token(&text, "upgrade", "websocket")
}

/// Check that an upgrade request carries everything the handshake needs.
///
/// The error is the reason sent back with the `400`.
pub fn check_upgrade_head(head: &[u8]) -> Result<(), &'static str> {
    if !is_upgrade_request(head) {
        return Err(NOT_WEBSOCKET_REASON);
    }

    let text = String::from_utf8_lossy(head);
    let mut request_line = text.split("\r\n").next().unwrap_or_default().split_whitespace();
    let is_get = request_line.next() == Some("GET");
    let is_http11 = request_line.nth(1) == Some("HTTP/1.1");

    let has_key = header_fields(&text)
        .any(|(name, value)| name.eq_ignore_ascii_case("sec-websocket-key") && !value.is_empty());
    let has_version = header_fields(&text)
        .any(|(name, value)| name.eq_ignore_ascii_case("sec-websocket-version") && value == "13");

    if is_get && is_http11 && has_key && has_version && has_token(&text, "connection", "upgrade") {
        Ok(())
    } else {
        Err(INVALID_HANDSHAKE_REASON)
    }
}

fn header_fields(text: &str) -> impl Iterator<Item = (&str, &str)> + '_ {
    text.split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
}

/// Whether header `name` lists `token` among its comma-separated values
fn has_token(text: &str, name: &str, token: &str) -> bool {
    header_fields(text).any(|(field, value)| {
        field.eq_ignore_ascii_case(name)
            && value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
    })
}

/// Answer a request with `400 Bad Request` and close the socket
pub async fn reject_bad_request<S>(stream: &mut S, reason: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        reason.len(),
        reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Stream that yields already-consumed bytes before reading the inner stream
///
/// Writes go straight to the inner stream.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// `Cookie` header value announcing `identity`
///
/// Header values must stay ASCII, so the name is percent-encoded.
pub fn identity_cookie(identity: &str) -> String {
    format!("{}={}", IDENTITY_COOKIE, urlencoding::encode(identity))
}

/// Pull the percent-decoded identity out of the request's `Cookie` headers
///
/// `uri` is only used for the error message.
pub fn identity_from_headers(headers: &HeaderMap, uri: &str) -> Result<String, ValidationError> {
    let raw = headers
        .get_all("cookie")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == IDENTITY_COOKIE)
        .map(|(_, value)| value.trim().trim_matches('"'));

    let Some(raw) = raw else {
        return Err(ValidationError::MissingIdentity(uri.to_string()));
    };

    let decoded = urlencoding::decode(raw)
        .map_err(|e| ValidationError::InvalidIdentity(e.to_string()))?;

    if decoded.is_empty() {
        return Err(ValidationError::MissingIdentity(uri.to_string()));
    }
    Ok(decoded.into_owned())
}
