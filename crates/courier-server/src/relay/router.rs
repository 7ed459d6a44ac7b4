//! Message router: decodes inbound frames and dispatches them by type.
//!
//! - `message`: stamped with the sender's identity, an id, status `sent` and
//!   a timestamp, delivered to the receiver, then acknowledged to the sender.
//! - `call` / `ice-candidate`: forwarded to the receiver untouched.
//! - `ack` from a receiver: a delivery or read receipt relayed back to the
//!   original sender.
//!
//! Nothing here blocks on a socket. All writes go through
//! [`ConnectionHandle::send`], so one slow receiver cannot stall a sender.

use super::connection::ConnectionHandle;
use super::delivery::{DeliveryTracker, MessageKey, ReceiptOutcome};
use super::registry::ConnectionRegistry;
use chrono::Utc;
use courier_core::{
    decode_frame, encode_frame, open_text, seal_text, Ack, ChatMessage, CourierResult, Decoded,
    Frame, FrameKind, Identity, MessageStatus, PayloadCipher, Signal,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an inbound frame produced no delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnknownType,
    ReceiverOffline,
    SenderMismatch,
    WriteFailed,
    InvalidReceipt,
    Cipher,
}

/// What the router did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Chat message written to the receiver and acknowledged to the sender.
    Delivered { message_id: u64 },
    /// Chat message could not reach its receiver.
    Undeliverable { message_id: u64 },
    /// Signal or receipt passed on to its receiver.
    Forwarded(FrameKind),
    Dropped(DropReason),
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    deliveries: Arc<DeliveryTracker>,
    cipher: Arc<dyn PayloadCipher>,
    notify_undeliverable: bool,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        deliveries: Arc<DeliveryTracker>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            registry,
            deliveries,
            cipher,
            notify_undeliverable: false,
        }
    }

    /// Send a `failed` ack to the sender when a message cannot be delivered.
    pub fn with_undeliverable_notices(mut self, enabled: bool) -> Self {
        self.notify_undeliverable = enabled;
        self
    }

    /// Route one inbound text frame from `sender`.
    pub fn route(&self, sender: &ConnectionHandle, raw: &str) -> RouteOutcome {
        let frame = match decode_frame(raw) {
            Ok(Decoded::Frame(frame)) => frame,
            Ok(Decoded::Unrecognized(tag)) => {
                warn!(identity = %sender.identity(), tag = ?tag, "unrecognized frame type, dropping");
                return RouteOutcome::Dropped(DropReason::UnknownType);
            }
            Err(e) => {
                warn!(identity = %sender.identity(), error = %e, "failed to decode frame");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };

        match frame {
            Frame::Message(msg) => self.relay_message(sender, msg),
            Frame::Call(signal) => self.forward_signal(sender, FrameKind::Call, signal, raw),
            Frame::IceCandidate(signal) => {
                self.forward_signal(sender, FrameKind::IceCandidate, signal, raw)
            }
            Frame::Ack(ack) => self.relay_receipt(sender, ack),
        }
    }

    fn relay_message(&self, sender: &ConnectionHandle, mut msg: ChatMessage) -> RouteOutcome {
        let from = sender.identity();
        if let Some(claimed) = msg.sender_id {
            if claimed != from && !claimed.is_nil() {
                warn!(identity = %from, claimed = %claimed, "message sender_id overridden with authenticated identity");
            }
        }
        msg.sender_id = Some(from);

        let message_id = match msg.id {
            Some(id) if DeliveryTracker::is_client_id(id) => id,
            _ => self.deliveries.next_message_id(),
        };
        msg.id = Some(message_id);
        msg.status = Some(MessageStatus::Sent);
        msg.created_at = Some(Utc::now());

        // With the no-op cipher `encrypted` is an opaque client field.
        if msg.encrypted && !self.cipher.is_passthrough() {
            match open_text(self.cipher.as_ref(), &msg.content) {
                Ok(plain) => {
                    msg.content = plain;
                    msg.encrypted = false;
                }
                Err(e) => {
                    warn!(identity = %from, message_id, error = %e, "failed to open message content");
                    return RouteOutcome::Dropped(DropReason::Cipher);
                }
            }
        }

        let receiver = msg.receiver_id;
        let target = match self.registry.require(&receiver) {
            Ok(target) => target,
            Err(e) => {
                debug!(from = %from, message_id, error = %e, "message dropped");
                self.notify_failure(sender, receiver, message_id);
                return RouteOutcome::Undeliverable { message_id };
            }
        };

        let outbound = match self.encode_outbound(Frame::Message(msg)) {
            Ok(text) => text,
            Err(e) => {
                warn!(identity = %from, message_id, error = %e, "failed to encode message");
                return RouteOutcome::Dropped(DropReason::Cipher);
            }
        };
        if let Err(e) = target.send(outbound) {
            warn!(from = %from, to = %receiver, message_id, error = %e, "message write failed");
            self.notify_failure(sender, receiver, message_id);
            return RouteOutcome::Undeliverable { message_id };
        }

        self.deliveries.record_sent(
            MessageKey {
                sender: from,
                id: message_id,
            },
            receiver,
        );
        let ack = Ack::for_sender(from, receiver, message_id, MessageStatus::Sent);
        self.send_frame(sender, Frame::Ack(ack));
        debug!(from = %from, to = %receiver, message_id, "message relayed");
        RouteOutcome::Delivered { message_id }
    }

    fn forward_signal(
        &self,
        sender: &ConnectionHandle,
        kind: FrameKind,
        mut signal: Signal,
        raw: &str,
    ) -> RouteOutcome {
        let from = sender.identity();
        match signal.sender_id {
            Some(claimed) if claimed != from => {
                warn!(identity = %from, claimed = %claimed, kind = %kind, "signal sender_id does not match connection, dropping");
                return RouteOutcome::Dropped(DropReason::SenderMismatch);
            }
            _ => {}
        }

        let receiver = signal.receiver_id;
        let target = match self.registry.require(&receiver) {
            Ok(target) => target,
            Err(e) => {
                debug!(from = %from, kind = %kind, error = %e, "signal dropped");
                return RouteOutcome::Dropped(DropReason::ReceiverOffline);
            }
        };

        let verbatim = signal.sender_id.is_some() && self.cipher.is_passthrough();
        let outbound = if verbatim {
            raw.to_string()
        } else {
            signal.sender_id = Some(from);
            let result = self.open_signal(&mut signal).and_then(|()| {
                let frame = match kind {
                    FrameKind::IceCandidate => Frame::IceCandidate(signal),
                    _ => Frame::Call(signal),
                };
                self.encode_outbound(frame)
            });
            match result {
                Ok(text) => text,
                Err(e) => {
                    warn!(identity = %from, kind = %kind, error = %e, "failed to re-encode signal");
                    return RouteOutcome::Dropped(DropReason::Cipher);
                }
            }
        };

        if let Err(e) = target.send(outbound) {
            warn!(from = %from, to = %receiver, kind = %kind, error = %e, "signal write failed");
            return RouteOutcome::Dropped(DropReason::WriteFailed);
        }
        RouteOutcome::Forwarded(kind)
    }

    fn relay_receipt(&self, sender: &ConnectionHandle, ack: Ack) -> RouteOutcome {
        let reporter = sender.identity();
        if !matches!(ack.status, MessageStatus::Delivered | MessageStatus::Read) {
            warn!(identity = %reporter, status = %ack.status, "receipt status not accepted from clients");
            return RouteOutcome::Dropped(DropReason::InvalidReceipt);
        }
        let Some(original_sender) = ack.receiver_id else {
            warn!(identity = %reporter, message_id = ack.id, "receipt missing receiver_id");
            return RouteOutcome::Dropped(DropReason::InvalidReceipt);
        };

        let key = MessageKey {
            sender: original_sender,
            id: ack.id,
        };
        match self.deliveries.apply_receipt(key, reporter, ack.status) {
            ReceiptOutcome::Advanced { from, to } => {
                debug!(message_id = ack.id, from = %from, to = %to, "delivery status advanced");
            }
            other => {
                warn!(identity = %reporter, message_id = ack.id, outcome = ?other, "receipt rejected");
                return RouteOutcome::Dropped(DropReason::InvalidReceipt);
            }
        }

        let Some(target) = self.registry.get(&original_sender) else {
            debug!(to = %original_sender, message_id = ack.id, "original sender not connected, receipt recorded only");
            return RouteOutcome::Dropped(DropReason::ReceiverOffline);
        };
        let receipt = Ack::for_sender(original_sender, reporter, ack.id, ack.status);
        if self.send_frame(&target, Frame::Ack(receipt)) {
            RouteOutcome::Forwarded(FrameKind::Ack)
        } else {
            RouteOutcome::Dropped(DropReason::WriteFailed)
        }
    }

    fn notify_failure(&self, sender: &ConnectionHandle, receiver: Identity, message_id: u64) {
        if !self.notify_undeliverable {
            return;
        }
        let ack = Ack::for_sender(sender.identity(), receiver, message_id, MessageStatus::Failed);
        self.send_frame(sender, Frame::Ack(ack));
    }

    /// Encode and queue a relay-generated frame. Returns `false` on failure.
    fn send_frame(&self, target: &ConnectionHandle, frame: Frame) -> bool {
        let kind = frame.kind();
        let result = encode_frame(&frame).and_then(|text| target.send(text));
        if let Err(e) = &result {
            warn!(to = %target.identity(), kind = %kind, error = %e, "failed to send relay frame");
        }
        result.is_ok()
    }

    /// Encode a client payload, sealing its content when a cipher is active.
    fn encode_outbound(&self, frame: Frame) -> CourierResult<String> {
        if self.cipher.is_passthrough() {
            return encode_frame(&frame);
        }
        let frame = match frame {
            Frame::Message(mut msg) => {
                msg.content = seal_text(self.cipher.as_ref(), &msg.content)?;
                msg.encrypted = true;
                Frame::Message(msg)
            }
            Frame::Call(signal) => Frame::Call(self.seal_signal(signal)?),
            Frame::IceCandidate(signal) => Frame::IceCandidate(self.seal_signal(signal)?),
            other => other,
        };
        encode_frame(&frame)
    }

    fn seal_signal(&self, mut signal: Signal) -> CourierResult<Signal> {
        if let Some(Value::String(content)) = signal.body.get("content") {
            let sealed = seal_text(self.cipher.as_ref(), content)?;
            signal.body.insert("content".into(), Value::String(sealed));
            signal.body.insert("encrypted".into(), Value::Bool(true));
        }
        Ok(signal)
    }

    fn open_signal(&self, signal: &mut Signal) -> CourierResult<()> {
        if self.cipher.is_passthrough() || !is_sealed(signal) {
            return Ok(());
        }
        if let Some(Value::String(content)) = signal.body.get("content") {
            let plain = open_text(self.cipher.as_ref(), content)?;
            signal.body.insert("content".into(), Value::String(plain));
        }
        signal.body.remove("encrypted");
        Ok(())
    }
}

fn is_sealed(signal: &Signal) -> bool {
    matches!(signal.body.get("encrypted"), Some(Value::Bool(true)))
}
