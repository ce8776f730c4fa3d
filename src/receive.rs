//! Receive loop shared by the server and the client
//!
//! Reads frames in arrival order while the connection is open. Text goes
//! to the caller's callback, Binary follows the `BinaryPolicy`, Close ends
//! the loop without another read. A read error triggers a best-effort
//! Close before the loop gives up.
//!
//! Cleanup (releasing the write half, deregistering) is the caller's job
//! so that it happens exactly once on every exit path.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ReceiveError;
use crate::message::{close_frame, unsupported_binary_frame, BinaryPolicy, InboundMessage};
use crate::types::ConnectionState;

/// Why a receive loop stopped
#[derive(Debug)]
pub enum LoopExit {
    /// Peer sent a Close frame
    PeerClosed(Option<CloseFrame<'static>>),
    /// We closed the connection because of a binary frame
    PolicyClosed,
    /// Stream ended without a Close frame
    StreamEnded,
    /// Someone else moved the connection out of the open state
    NotOpen(ConnectionState),
    /// Reading failed
    Failed(ReceiveError),
}

impl LoopExit {
    /// Whether the loop ended through a close handshake
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::PeerClosed(_) | Self::PolicyClosed | Self::NotOpen(_))
    }

    /// Whether our Close went out and the peer's reply is still unread
    pub fn awaits_close_reply(&self) -> bool {
        matches!(
            self,
            Self::PolicyClosed | Self::NotOpen(ConnectionState::CloseSent)
        )
    }
}

/// Drive `stream` until the connection stops being open.
pub async fn run_receive_loop<St, F>(
    stream: &mut St,
    connection: &Connection,
    binary_policy: BinaryPolicy,
    mut on_text: F,
) -> LoopExit
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: FnMut(String),
{
    let id = connection.id();

    while connection.is_open() {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(connection_id = %id, "Receive error: {}", e);
                if connection.is_open() {
                    let reason = format!("receive error, {}", e);
                    if let Err(close_err) = connection
                        .send_close(close_frame(CloseCode::Normal, &reason))
                        .await
                    {
                        debug!(connection_id = %id, "Close after receive error failed: {}", close_err);
                    }
                }
                connection.mark_aborted();
                return LoopExit::Failed(ReceiveError::from(e));
            }
            None => {
                debug!(connection_id = %id, "Stream ended without close frame");
                return LoopExit::StreamEnded;
            }
        };

        match InboundMessage::from(msg) {
            InboundMessage::Text(text) => on_text(text),
            InboundMessage::Binary(data) => match binary_policy {
                BinaryPolicy::Ignore => {
                    debug!(connection_id = %id, len = data.len(), "Ignoring binary frame");
                }
                BinaryPolicy::Reject => {
                    warn!(connection_id = %id, len = data.len(), "Rejecting binary frame");
                    if let Err(e) = connection.send_close(unsupported_binary_frame()).await {
                        debug!(connection_id = %id, "Unsupported-data close failed: {}", e);
                    }
                    return LoopExit::PolicyClosed;
                }
            },
            InboundMessage::Close(frame) => {
                debug!(connection_id = %id, ?frame, "Close frame received");
                connection.mark_close_received();
                return LoopExit::PeerClosed(frame);
            }
            InboundMessage::Control => {}
        }
    }

    LoopExit::NotOpen(connection.state())
}

/// After we sent Close, read until the peer answers or `limit` passes.
///
/// Data frames arriving in between are dropped.
pub async fn await_close_reply<St>(stream: &mut St, connection: &Connection, limit: Duration)
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let drained = tokio::time::timeout(limit, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Close(_) = msg {
                connection.mark_close_received();
                return;
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!(connection_id = %connection.id(), "Peer did not answer close in {:?}", limit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::stream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    use super::*;
    use crate::connection::test_support::*;

    type Frame = Result<Message, tungstenite::Error>;

    #[tokio::test]
    async fn test_text_then_close_stops_reading() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        let mut frames = stream::iter(vec![
            Ok(Message::Text("a".into())),
            Ok(Message::Text("b".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("c".into())),
        ] as Vec<Frame>);

        let mut seen = Vec::new();
        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Ignore, |t| seen.push(t)).await;

        assert!(matches!(exit, LoopExit::PeerClosed(None)));
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(conn.state(), ConnectionState::CloseReceived);

        // The frame after Close was never read
        assert!(matches!(frames.next().await, Some(Ok(Message::Text(t))) if t.as_str() == "c"));
    }

    #[tokio::test]
    async fn test_binary_rejected_with_unsupported_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        let mut frames = stream::iter(vec![
            Ok(Message::Binary(vec![0xde, 0xad].into())),
            Ok(Message::Text("after".into())),
        ] as Vec<Frame>);

        let mut seen = Vec::new();
        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Reject, |t| seen.push(t)).await;

        assert!(matches!(exit, LoopExit::PolicyClosed));
        assert!(seen.is_empty());
        assert_eq!(conn.state(), ConnectionState::CloseSent);
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_binary_ignored_on_client() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        let mut frames = stream::iter(vec![
            Ok(Message::Binary(vec![1].into())),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::Text("still here".into())),
        ] as Vec<Frame>);

        let mut seen = Vec::new();
        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Ignore, |t| seen.push(t)).await;

        assert!(matches!(exit, LoopExit::StreamEnded));
        assert_eq!(seen, vec!["still here".to_string()]);
    }

    #[tokio::test]
    async fn test_error_sends_best_effort_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        let mut frames = stream::iter(vec![Err(tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake,
        ))] as Vec<Frame>);

        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Reject, |_| {}).await;

        assert!(matches!(exit, LoopExit::Failed(_)));
        assert!(!exit.is_graceful());
        assert_eq!(conn.state(), ConnectionState::Aborted);
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert!(frame.reason.starts_with("receive error"));
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_with_dead_writer_still_exits() {
        let conn = open_connection(failing_sink());
        let mut frames = stream::iter(vec![Err(tungstenite::Error::ConnectionClosed)] as Vec<Frame>);

        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Reject, |_| {}).await;
        assert!(matches!(exit, LoopExit::Failed(_)));
        assert_eq!(conn.state(), ConnectionState::Aborted);
    }

    #[tokio::test]
    async fn test_await_close_reply_completes_handshake() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        conn.send_close(unsupported_binary_frame()).await.unwrap();

        let mut frames = stream::iter(vec![
            Ok(Message::Text("late".into())),
            Ok(Message::Close(None)),
        ] as Vec<Frame>);
        await_close_reply(&mut frames, &conn, Duration::from_secs(1)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_await_close_reply_gives_up() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        conn.send_close(unsupported_binary_frame()).await.unwrap();

        let mut frames = stream::pending::<Frame>();
        await_close_reply(&mut frames, &conn, Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::CloseSent);
    }

    #[tokio::test]
    async fn test_local_close_mid_loop_leaves_reply_to_read() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(open_connection(recording_sink(tx)));
        let closer = Arc::clone(&conn);
        let mut frames = Box::pin(stream::iter(0..3).then(move |step| {
            let closer = Arc::clone(&closer);
            async move {
                let frame: Frame = match step {
                    0 => Ok(Message::Text("trigger".into())),
                    1 => {
                        // Our Close goes out while the loop waits for this frame
                        closer
                            .send_close(close_frame(CloseCode::Away, "server shutting down"))
                            .await
                            .unwrap();
                        Ok(Message::Text("late".into()))
                    }
                    _ => Ok(Message::Close(None)),
                };
                frame
            }
        }));

        let mut seen = Vec::new();
        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Reject, |t| seen.push(t)).await;

        assert!(matches!(exit, LoopExit::NotOpen(ConnectionState::CloseSent)));
        assert!(exit.awaits_close_reply());
        assert_eq!(seen, vec!["trigger".to_string(), "late".to_string()]);

        await_close_reply(&mut frames, &conn, Duration::from_secs(1)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_only_local_close_awaits_reply() {
        assert!(LoopExit::PolicyClosed.awaits_close_reply());
        assert!(!LoopExit::PeerClosed(None).awaits_close_reply());
        assert!(!LoopExit::StreamEnded.awaits_close_reply());
        assert!(!LoopExit::NotOpen(ConnectionState::Aborted).awaits_close_reply());
    }

    #[tokio::test]
    async fn test_no_read_when_not_open() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = open_connection(recording_sink(tx));
        conn.mark_aborted();
        let mut frames = stream::iter(vec![Ok(Message::Text("x".into()))] as Vec<Frame>);

        let exit = run_receive_loop(&mut frames, &conn, BinaryPolicy::Ignore, |_| {}).await;
        assert!(matches!(exit, LoopExit::NotOpen(ConnectionState::Aborted)));
        assert!(frames.next().await.is_some());
    }
}
