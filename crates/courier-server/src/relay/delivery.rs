//! Delivery receipt tracking.
//!
//! Every relayed chat message is remembered by (original sender, id) until
//! it reaches a terminal status or ages out. Receipts from the receiver may
//! only move a message forward: sent, then delivered, then read.
//!
//! Client-chosen ids live below [`RELAY_ID_BASE`]; ids the relay assigns
//! live in `[RELAY_ID_BASE, 2^53)`, so the two never collide and both stay
//! exact as JSON numbers.

use courier_core::{Identity, MessageStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// First relay-assigned message id (2^52).
pub const RELAY_ID_BASE: u64 = 1 << 52;
const RELAY_ID_END: u64 = 1 << 53;

/// Default bound on tracked messages.
pub const DEFAULT_MAX_RECORDS: usize = 100_000;

/// Key of a tracked message. Client-chosen ids are only unique per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender: Identity,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub receiver: Identity,
    pub status: MessageStatus,
    pub updated_at: Instant,
}

/// Result of applying a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Advanced { from: MessageStatus, to: MessageStatus },
    UnknownMessage,
    NotReceiver,
    Regressed { current: MessageStatus, requested: MessageStatus },
}

#[derive(Debug)]
pub struct DeliveryTracker {
    records: DashMap<MessageKey, DeliveryRecord>,
    next_id: AtomicU64,
    max_records: usize,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }

    /// Track at most `max_records` messages at once.
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(RELAY_ID_BASE),
            max_records,
        }
    }

    /// Whether `id` is usable as a client-chosen message id.
    pub fn is_client_id(id: u64) -> bool {
        id != 0 && id < RELAY_ID_BASE
    }

    /// Relay-assigned id for a message the client left unnumbered.
    pub fn next_message_id(&self) -> u64 {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id + 1 >= RELAY_ID_END { RELAY_ID_BASE } else { id + 1 })
            })
            .unwrap_or(RELAY_ID_BASE)
    }

    /// Start tracking a relayed message. Returns `false` when the tracker is
    /// full; receipts for that message are then reported as unknown.
    pub fn record_sent(&self, key: MessageKey, receiver: Identity) -> bool {
        if self.records.len() >= self.max_records && !self.records.contains_key(&key) {
            debug!(sender = %key.sender, message_id = key.id, "delivery tracker full, not tracking");
            return false;
        }
        self.records.insert(
            key,
            DeliveryRecord {
                receiver,
                status: MessageStatus::Sent,
                updated_at: Instant::now(),
            },
        );
        true
    }

    /// Apply a receipt sent by `reporter` for the message at `key`.
    pub fn apply_receipt(
        &self,
        key: MessageKey,
        reporter: Identity,
        requested: MessageStatus,
    ) -> ReceiptOutcome {
        let outcome = {
            let Some(mut record) = self.records.get_mut(&key) else {
                return ReceiptOutcome::UnknownMessage;
            };
            if record.receiver != reporter {
                return ReceiptOutcome::NotReceiver;
            }
            let current = record.status;
            if !current.can_advance_to(requested) {
                return ReceiptOutcome::Regressed { current, requested };
            }
            record.status = requested;
            record.updated_at = Instant::now();
            ReceiptOutcome::Advanced {
                from: current,
                to: requested,
            }
        };
        if requested.is_terminal() {
            self.records.remove(&key);
        }
        outcome
    }

    pub fn status(&self, key: &MessageKey) -> Option<MessageStatus> {
        self.records.get(key).map(|record| record.status)
    }

    /// Forget records untouched for longer than `max_age`.
    pub fn gc(&self, max_age: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.updated_at.elapsed() <= max_age);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(count = removed, "GC removed stale delivery records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
