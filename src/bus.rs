//! Input fan-in and output fan-out between transports and the session.
use tokio::sync::{broadcast, mpsc};

pub const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Console,
    Web,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub source: InputSource,
    pub text: String,
}

/// Sending half of the single session input queue. Cheap to clone; every
/// transport holds one.
#[derive(Debug, Clone)]
pub struct InputQueue {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

pub type InputReceiver = mpsc::UnboundedReceiver<InboundMessage>;

impl InputQueue {
    pub fn new() -> (Self, InputReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the session has stopped receiving.
    pub fn push(&self, source: InputSource, text: impl Into<String>) -> bool {
        let message = InboundMessage {
            source,
            text: text.into(),
        };
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(source = ?err.0.source, "input queue closed; message dropped");
                false
            }
        }
    }
}

/// Output fan-out to web clients. Publishing never blocks and never fails.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, text: impl Into<String>) {
        if let Err(err) = self.tx.send(text.into()) {
            tracing::debug!(error = %err, "broadcast dropped; no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
