use crate::core::error::SyncError;
use crate::core::state::PlaybackOutcome;
use log::debug;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenterEvent {
    TtsStart,
    TtsEnd {
        outcome: PlaybackOutcome,
    },
    Subtitle(String),
    /// An emotion resolved to a concrete expression file.
    ExpressionTriggered {
        emotion: String,
        expression: String,
        file: String,
    },
    /// An expression was played by name.
    ExpressionPlayed {
        expression: String,
        file: String,
    },
    ExpressionBound {
        emotion: String,
        expression: String,
        files: Vec<String>,
    },
    ExpressionUnbound {
        emotion: String,
        expression: String,
    },
    Fault(SyncError),
}

/// Typed publish/subscribe channel shared by the mapper and the playback engine.
///
/// Publishing never fails: with no live subscriber the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PresenterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenterEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PresenterEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dropped, no subscribers");
        }
    }

    pub fn fault(&self, error: SyncError) {
        self.emit(PresenterEvent::Fault(error));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
