use thiserror::Error;

/// Recoverable failure kinds. None of these abort a session: each one is
/// logged and published as [`crate::core::events::PresenterEvent::Fault`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("expression config unavailable for '{character}': {reason}")]
    ConfigUnavailable { character: String, reason: String },

    #[error("no expression bound to emotion '{0}'")]
    UnresolvedEmotion(String),

    #[error("playback failed: {0}")]
    PlaybackFailure(String),

    #[error("marker <{0}> has no entry in the expression config")]
    MalformedMarker(String),
}
