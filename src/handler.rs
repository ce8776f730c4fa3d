//! WebSocket connection handler
//!
//! Handles one accepted TCP connection from the first byte to the last:
//! plain HTTP rejection, upgrade with identity validation, registration,
//! the receive loop and deregistration.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{AppError, ValidationError};
use crate::message::BinaryPolicy;
use crate::receive::{await_close_reply, run_receive_loop, LoopExit};
use crate::registry::ConnectionRegistry;
use crate::transport::{
    check_upgrade_head, identity_from_headers, read_request_head, reject_bad_request,
    PrefixedStream,
};
use crate::types::{ChannelName, ConnectionId};

/// What the server learns from a valid upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Host the client addressed
    pub host: String,
    /// Channel label from the path
    pub channel: ChannelName,
    /// Percent-decoded `ClientName` cookie
    pub identity: String,
}

impl UpgradeRequest {
    /// Extract channel and identity, rejecting requests without a name
    pub fn parse(req: &Request) -> Result<Self, ValidationError> {
        let uri = req.uri();
        let identity = identity_from_headers(req.headers(), &uri.to_string())?;
        let host = uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get("host")
                    .and_then(|h| h.to_str().ok())
                    .map(|h| h.split(':').next().unwrap_or(h).to_string())
            })
            .unwrap_or_default();

        Ok(Self {
            host,
            channel: ChannelName::from_path(uri.path()),
            identity,
        })
    }
}

/// Handle a new TCP connection
///
/// Every error is scoped to this connection; the accept loop only logs it.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
) -> Result<(), AppError> {
    debug!("New TCP connection from {}", peer);

    let head = read_request_head(&mut stream, config.max_head_size).await?;
    if let Err(reason) = check_upgrade_head(&head) {
        info!(peer = %peer, reason, "Rejecting request");
        reject_bad_request(&mut stream, reason).await?;
        return Ok(());
    }
    let stream = PrefixedStream::new(head, stream);

    // WebSocket handshake, validating the identity before answering 101
    let mut upgrade = None;
    let mut rejection = None;
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match UpgradeRequest::parse(req) {
                Ok(parsed) => {
                    upgrade = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    let rejected = bad_request(e.to_string());
                    rejection = Some(e);
                    Err(rejected)
                }
            }
        },
        Some(config.websocket()),
    )
    .await;

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            return Err(match rejection {
                Some(validation) => validation.into(),
                None => e.into(),
            })
        }
    };
    let Some(upgrade) = upgrade else {
        return Err(ValidationError::MissingIdentity(peer.to_string()).into());
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let id = ConnectionId::new();
    let connection = Arc::new(Connection::new(
        id,
        Some(upgrade.identity.clone()),
        upgrade.channel.clone(),
        ws_sender,
        config.send_timeout,
    ));

    info!(
        connection_id = %id,
        identity = %upgrade.identity,
        channel = %upgrade.channel,
        "Client connected: {} -> {}/{}",
        upgrade.identity,
        upgrade.host,
        upgrade.channel
    );

    let registration = registry.register_guarded(id, Arc::clone(&connection));

    let exit = run_receive_loop(&mut ws_receiver, &connection, BinaryPolicy::Reject, |text| {
        debug!(connection_id = %id, len = text.len(), "Text frame received");
    })
    .await;

    // Out of the broadcast set before the socket goes away
    drop(registration);

    if exit.awaits_close_reply() {
        await_close_reply(&mut ws_receiver, &connection, config.send_timeout).await;
    }
    connection.release().await;

    info!(connection_id = %id, identity = %upgrade.identity, ?exit, "Client disconnected");

    match exit {
        LoopExit::Failed(e) => Err(e.into()),
        _ => Ok(()),
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn request(uri: &str, cookie: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(uri).header("host", "localhost:25410");
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_parse_upgrade_request() {
        let parsed = UpgradeRequest::parse(&request("/Default", Some("ClientName=dev%201"))).unwrap();
        assert_eq!(parsed.channel.as_str(), "Default");
        assert_eq!(parsed.identity, "dev 1");
        assert_eq!(parsed.host, "localhost");
    }

    #[test]
    fn test_parse_rejects_missing_identity() {
        let err = UpgradeRequest::parse(&request("/Default", None)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingIdentity(_)));
    }

    #[test]
    fn test_bad_request_response() {
        let response = bad_request("Client name is empty".to_string());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("Client name is empty"));
    }
}
