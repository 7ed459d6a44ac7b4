//! JSON wire frames exchanged over a relay connection.
//!
//! Every frame is a JSON object carrying a `type` tag. Routing only ever
//! reads the outer envelope (`type`, `sender_id`, `receiver_id`, `id`);
//! everything else travels through untouched.

use crate::error::{CourierError, CourierResult};
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Delivery status of a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Whether a receiver-visible transition from `self` to `next` is allowed.
    ///
    /// Status only moves forward: `sent -> delivered -> read`, or `sent -> failed`.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sent, Delivered) | (Sent, Read) | (Delivered, Read) | (Sent, Failed)
        )
    }

    /// No further transitions are possible from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of frame type tags understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Message,
    Call,
    IceCandidate,
    Ack,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Message => "message",
            FrameKind::Call => "call",
            FrameKind::IceCandidate => "ice-candidate",
            FrameKind::Ack => "ack",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "message" => Some(FrameKind::Message),
            "call" => Some(FrameKind::Call),
            "ice-candidate" => Some(FrameKind::IceCandidate),
            "ack" => Some(FrameKind::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A one-to-one chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message identifier; `0` or absent means the relay assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Identity>,
    pub receiver_id: Identity,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when `content` holds sealed (base64) ciphertext.
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    /// Fields the relay does not interpret (media metadata, reply ids, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Call-signaling or ICE-candidate payload. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Identity>,
    pub receiver_id: Identity,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Status-only acknowledgment. Generated by the relay for senders, or sent by
/// receivers as a delivery/read receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<Identity>,
    pub id: u64,
    pub status: MessageStatus,
    #[serde(default)]
    pub content: String,
}

impl Ack {
    /// Build the ack returned to the original sender of `message_id`.
    pub fn for_sender(
        original_sender: Identity,
        original_receiver: Identity,
        message_id: u64,
        status: MessageStatus,
    ) -> Self {
        let content = match status {
            MessageStatus::Sent => "Message sent successfully",
            MessageStatus::Delivered => "Message delivered",
            MessageStatus::Read => "Message read",
            MessageStatus::Failed => "Message could not be delivered",
        };
        Self {
            sender_id: Some(original_receiver),
            receiver_id: Some(original_sender),
            id: message_id,
            status,
            content: content.to_string(),
        }
    }
}

/// A decoded frame, dispatched by variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "message")]
    Message(ChatMessage),
    #[serde(rename = "call")]
    Call(Signal),
    #[serde(rename = "ice-candidate")]
    IceCandidate(Signal),
    #[serde(rename = "ack")]
    Ack(Ack),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Message(_) => FrameKind::Message,
            Frame::Call(_) => FrameKind::Call,
            Frame::IceCandidate(_) => FrameKind::IceCandidate,
            Frame::Ack(_) => FrameKind::Ack,
        }
    }
}

/// Result of decoding an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    /// Well-formed JSON object whose `type` is missing or unknown.
    Unrecognized(Option<String>),
}

/// Decode an inbound text frame.
///
/// Non-JSON input, non-object JSON, or a known `type` whose fields do not
/// fit the schema are decode errors. A missing or unknown `type` is not an
/// error; it yields [`Decoded::Unrecognized`].
pub fn decode_frame(text: &str) -> CourierResult<Decoded> {
    let value: Value = serde_json::from_str(text)?;
    let tag = {
        let obj = value
            .as_object()
            .ok_or_else(|| CourierError::Decode("frame is not a JSON object".into()))?;
        match obj.get("type") {
            Some(Value::String(t)) => t.clone(),
            Some(other) => return Ok(Decoded::Unrecognized(Some(other.to_string()))),
            None => return Ok(Decoded::Unrecognized(None)),
        }
    };

    if FrameKind::from_tag(&tag).is_none() {
        return Ok(Decoded::Unrecognized(Some(tag)));
    }

    let frame: Frame = serde_json::from_value(value)?;
    Ok(Decoded::Frame(frame))
}

/// Encode a frame as a JSON text frame.
pub fn encode_frame(frame: &Frame) -> CourierResult<String> {
    serde_json::to_string(frame).map_err(|e| CourierError::Other(format!("frame encode: {e}")))
}
