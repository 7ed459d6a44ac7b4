//! Live connection handle: the registry's view of one transport.
//!
//! Writes never touch the socket directly. Each handle feeds a bounded
//! queue drained by the connection's single writer task, so concurrent
//! senders cannot interleave frames and never block on socket I/O.

use courier_core::{CourierError, CourierResult, Identity};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Handle to one authenticated, registered connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    /// Outbound text frames, drained by the writer task.
    tx: mpsc::Sender<String>,
    closed: AtomicBool,
    superseded: AtomicBool,
    close_notify: Notify,
    connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            identity,
            tx,
            closed: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            close_notify: Notify::new(),
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Queue a text frame for the writer task without waiting.
    pub fn send(&self, frame: String) -> CourierResult<()> {
        if self.is_closed() {
            return Err(CourierError::TransportWrite(format!(
                "connection {} is closed",
                self.id
            )));
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(CourierError::TransportWrite(format!(
                    "outbound queue full for connection {}",
                    self.id
                )))
            }
            Err(TrySendError::Closed(_)) => Err(CourierError::TransportWrite(format!(
                "writer for connection {} has exited",
                self.id
            ))),
        }
    }

    /// Signal closure. Returns `true` if this call performed the close.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.close_notify.notify_waiters();
        }
        first
    }

    /// Close because a newer connection took over this identity.
    pub fn supersede(&self) -> bool {
        self.superseded.store(true, Ordering::Release);
        self.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn was_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    /// Resolves once the handle has been closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Frames dropped because the outbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
