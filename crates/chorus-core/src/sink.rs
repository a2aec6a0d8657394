use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::events::ChatEvent;

/// Receives [`ChatEvent`]s as they happen. Implementations must not block;
/// the routing core calls `emit` from inside its async tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChatEvent);
}

impl EventSink for broadcast::Sender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        // No subscribers is not an error.
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        let _ = self.send(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: ChatEvent) {
        (**self).emit(event);
    }
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ChatEvent) {}
}
