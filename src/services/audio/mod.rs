//! The audio side of playback: something that decodes a clip, plays it, and
//! exposes an analysis buffer while it plays.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod wav;

pub use wav::WavClip;

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Decoding finished; the duration is known.
    Ready { duration: Duration },
    Play,
    Ended,
    Error(String),
}

pub trait AudioSource {
    /// Starts decoding. Lifecycle notifications arrive on the returned channel.
    fn open(&mut self) -> mpsc::UnboundedReceiver<AudioEvent>;

    /// Starts playback. `Play` is announced on the event channel.
    fn play(&mut self) -> Result<()>;

    /// Fills `out` with the analysis buffer for the current playback position.
    fn frequency_data(&mut self, out: &mut [u8]);

    /// Cancels timers and frees the decoded clip. Safe to call repeatedly.
    fn release(&mut self);
}
