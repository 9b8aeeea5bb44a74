//! Watch/notify types.
//!
//! Watchers receive notifications over a channel and acknowledge them back
//! through the channel embedded in each notification; the notifier gathers
//! acknowledgements until its timeout expires. There is no blocking wait
//! loop anywhere; both sides are plain async channel endpoints.

use bytes::Bytes;
use tokio::sync::mpsc;

/// An acknowledgement from one watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAck {
    /// The acknowledging watcher's id.
    pub watcher: u64,
    /// Opaque reply payload.
    pub reply: Bytes,
}

/// Outcome of a notify: who acknowledged and who did not in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyResult {
    /// Acknowledgements received before the timeout.
    pub acks: Vec<NotifyAck>,
    /// Watcher ids that did not acknowledge in time.
    pub timed_out: Vec<u64>,
}

/// A notification delivered to one watcher.
#[derive(Debug)]
pub struct Notification {
    /// Id of the notify operation this belongs to.
    pub notify_id: u64,
    /// Payload supplied by the notifier.
    pub payload: Bytes,
    pub(crate) ack_tx: mpsc::UnboundedSender<NotifyAck>,
}

impl Notification {
    /// Acknowledges the notification with a reply payload.
    ///
    /// Dropping the notification without acknowledging counts as a timeout
    /// on the notifier's side.
    pub fn ack(&self, watcher: u64, reply: Bytes) {
        // The notifier may have already timed out and dropped its receiver.
        let _ = self.ack_tx.send(NotifyAck { watcher, reply });
    }
}

/// The receiving side of a watch registration.
#[derive(Debug)]
pub struct WatchHandle {
    /// The watcher's id, unique within the store.
    pub id: u64,
    pub(crate) rx: mpsc::UnboundedReceiver<Notification>,
}

impl WatchHandle {
    /// Waits for the next notification. Returns `None` once the watch is
    /// dropped by the store.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Returns a queued notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}
