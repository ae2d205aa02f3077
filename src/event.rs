use tokio::sync::mpsc;

use crate::queue::QueuedWrite;

/// Outcomes reported asynchronously to the host UI.
#[derive(Debug, Clone)]
pub enum Event {
  /// The server rejected the session token; the host should sign the user out
  SessionExpired,
  /// A write was accepted locally and is waiting for delivery
  WriteQueued { id: String, resource: String },
  /// A queued write was confirmed by the server
  WriteDelivered { id: String, resource: String },
  /// A queued write failed for good; the user must acknowledge it.
  /// The write keeps its original payload and carries the error in `last_error`.
  WriteFailed(QueuedWrite),
  /// Writes still pending when the queue was drained at logout
  PendingDiscarded(Vec<QueuedWrite>),
  /// A reminder could not be scheduled or cancelled
  ReminderWarning { entity_id: String, message: String },
}

pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving end of the event channel, owned by the host UI loop.
pub struct EventHandler {
  tx: EventSender,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender to hand to the components that report events.
  pub fn sender(&self) -> EventSender {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Drain whatever is already queued without waiting.
  pub fn pending(&mut self) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
