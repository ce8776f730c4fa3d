//! Frame-level message definitions
//!
//! Classifies inbound frames, serializes outbound broadcast payloads to
//! UTF-8 text and builds the close frames used by the lifecycle code.

use std::borrow::Cow;

use serde::Serialize;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Control frames may carry at most 125 bytes; 2 go to the status code.
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// Reason sent when the server refuses a binary frame
pub const BINARY_UNSUPPORTED_REASON: &str = "binary messages are not supported";

/// A received frame, reduced to what the receive loop cares about
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// UTF-8 text payload
    Text(String),
    /// Raw bytes, handled according to `BinaryPolicy`
    Binary(Vec<u8>),
    /// Peer started or answered the close handshake
    Close(Option<CloseFrame<'static>>),
    /// Ping/Pong/raw frames, answered by the transport itself
    Control,
}

impl From<Message> for InboundMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Self::Text(text.to_string()),
            Message::Binary(data) => Self::Binary(data.as_slice().to_vec()),
            Message::Close(frame) => Self::Close(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Self::Control,
        }
    }
}

/// What a receive loop does with binary frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryPolicy {
    /// Close the connection with 1003 (unsupported data)
    Reject,
    /// Drop the frame and keep reading
    Ignore,
}

/// A named broadcast event with its payload already serialized
///
/// The event name is metadata only; the wire carries the payload as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBroadcast {
    pub event: String,
    pub payload: String,
}

impl OutboundBroadcast {
    /// Serialize `payload` for `event`
    pub fn new<T: Serialize + ?Sized>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            payload: serialize_payload(payload)?,
        })
    }

    /// The single text frame sent to each connection
    pub fn to_message(&self) -> Message {
        Message::Text(self.payload.clone().into())
    }
}

/// Turn a payload into the text sent on the wire.
///
/// Strings pass through untouched; anything else becomes compact JSON.
pub fn serialize_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(payload)?;
    if json.starts_with('"') {
        return serde_json::from_str::<String>(&json);
    }
    Ok(json)
}

/// Build a close frame, trimming the reason to the control-frame limit
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    }
}

/// Close frame for the server's binary-frame rejection
pub fn unsupported_binary_frame() -> CloseFrame<'static> {
    close_frame(CloseCode::Unsupported, BINARY_UNSUPPORTED_REASON)
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Serialize)]
    struct Reading {
        sensor: String,
        value: i32,
    }

    #[test]
    fn test_string_payload_passes_through() {
        assert_eq!(serialize_payload("{\"x\":1}").unwrap(), "{\"x\":1}");
        assert_eq!(
            serialize_payload(&"12:00:00 000,hello from server".to_string()).unwrap(),
            "12:00:00 000,hello from server"
        );
    }

    #[test]
    fn test_string_with_escapes_is_not_quoted() {
        assert_eq!(serialize_payload("a \"quoted\"\nline").unwrap(), "a \"quoted\"\nline");
    }

    #[test]
    fn test_structured_payload_becomes_json() {
        assert_eq!(serialize_payload(&json!({"x": 1})).unwrap(), "{\"x\":1}");

        let reading = Reading {
            sensor: "t1".to_string(),
            value: 7,
        };
        assert_eq!(
            serialize_payload(&reading).unwrap(),
            "{\"sensor\":\"t1\",\"value\":7}"
        );
        assert_eq!(serialize_payload(&42).unwrap(), "42");
    }

    #[test]
    fn test_outbound_broadcast_message() {
        let broadcast = OutboundBroadcast::new("test", &json!({"x": 1})).unwrap();
        assert_eq!(broadcast.event, "test");
        assert_eq!(broadcast.to_message(), Message::Text("{\"x\":1}".into()));
    }

    #[test]
    fn test_classify_frames() {
        assert_eq!(
            InboundMessage::from(Message::Text("hi".into())),
            InboundMessage::Text("hi".to_string())
        );
        assert_eq!(
            InboundMessage::from(Message::Binary(vec![1, 2].into())),
            InboundMessage::Binary(vec![1, 2])
        );
        assert_eq!(InboundMessage::from(Message::Close(None)), InboundMessage::Close(None));
        assert_eq!(InboundMessage::from(Message::Ping(Vec::new().into())), InboundMessage::Control);
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let frame = close_frame(CloseCode::Normal, &long);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON_LEN);
        assert!(frame.reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_unsupported_binary_frame() {
        let frame = unsupported_binary_frame();
        assert_eq!(frame.code, CloseCode::Unsupported);
        assert_eq!(frame.reason, BINARY_UNSUPPORTED_REASON);
    }
}
