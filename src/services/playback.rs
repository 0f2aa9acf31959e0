//! Text/audio/expression synchronization for one segment at a time.
//!
//! The engine is a plain state machine: the caller feeds it audio lifecycle
//! events and frame ticks stamped with the current clock reading, and it
//! drives the mapper, the renderer and the event bus. See
//! [`crate::services::presenter`] for the async loop that does the feeding.

use crate::core::config::PlaybackConfig;
use crate::core::error::SyncError;
use crate::core::events::{EventBus, PresenterEvent};
use crate::core::state::{EmotionMarker, MarkerKind, PlaybackOutcome, PlaybackState};
use crate::services::audio::AudioEvent;
use crate::services::expression::SharedMapper;
use crate::services::render::Renderer;
use log::{debug, error, info, warn};
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Text is prepared, waiting for the audio to decode and start.
    Priming,
    Playing,
}

/// Mouth openness from an analysis buffer: the mean of the lower half of the
/// bins, normalized and eased with `^0.8`.
pub fn mouth_value(bins: &[u8]) -> f32 {
    let half = &bins[..(bins.len() / 2).max(1).min(bins.len())];
    if half.is_empty() {
        return 0.0;
    }
    let sum: u32 = half.iter().map(|&b| b as u32).sum();
    let avg = sum as f32 / half.len() as f32;
    (avg / 256.0).powf(0.8)
}

pub struct PlaybackEngine {
    mapper: SharedMapper,
    renderer: Rc<dyn Renderer>,
    events: EventBus,
    config: PlaybackConfig,
    subtitle_label: String,
    phase: Phase,
    state: Option<PlaybackState>,
    char_interval: Duration,
    next_reveal: Duration,
    /// Text of every completed segment since the last reset.
    displayed_text: String,
    settle_queue: Vec<String>,
}

impl PlaybackEngine {
    pub fn new(
        mapper: SharedMapper,
        renderer: Rc<dyn Renderer>,
        config: PlaybackConfig,
        subtitle_label: &str,
    ) -> Self {
        let events = mapper.borrow().events().clone();
        Self {
            mapper,
            renderer,
            events,
            config,
            subtitle_label: subtitle_label.to_string(),
            phase: Phase::Idle,
            state: None,
            char_interval: Duration::ZERO,
            next_reveal: Duration::ZERO,
            displayed_text: String::new(),
            settle_queue: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_playing(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn state(&self) -> Option<&PlaybackState> {
        self.state.as_ref()
    }

    pub fn displayed_text(&self) -> &str {
        &self.displayed_text
    }

    pub fn char_interval(&self) -> Duration {
        self.char_interval
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Prepares `text` for playback. Returns false, touching nothing, when a
    /// segment is already live.
    pub fn begin(&mut self, text: &str) -> bool {
        if self.phase != Phase::Idle {
            warn!("A segment is already playing, refusing new segment");
            return false;
        }

        let prepared = self.mapper.borrow().prepare_text(text);
        debug!(
            "Priming segment: {} chars, {} markers",
            prepared.text.chars().count(),
            prepared.markers.len()
        );

        self.state = Some(PlaybackState::new(text, prepared.text, prepared.markers));
        self.settle_queue.clear();
        self.char_interval = self.config.char_interval(Duration::ZERO, 0);
        self.phase = Phase::Priming;
        self.events.emit(PresenterEvent::TtsStart);
        true
    }

    /// Applies an audio lifecycle event. Returns the outcome when the event
    /// ends the segment.
    pub fn on_audio_event(&mut self, event: AudioEvent, now: Duration) -> Option<PlaybackOutcome> {
        if self.phase == Phase::Idle {
            debug!("Ignoring {:?} while idle", event);
            return None;
        }

        match event {
            AudioEvent::Ready { duration } => {
                let text_len = self.state.as_ref().map_or(0, |s| s.text_len);
                self.char_interval = self.config.char_interval(duration, text_len);
                debug!(
                    "Audio ready: {:?} for {} chars, {:?} per char",
                    duration, text_len, self.char_interval
                );
                None
            }
            AudioEvent::Play => {
                if self.phase == Phase::Priming {
                    self.phase = Phase::Playing;
                    self.next_reveal = now + self.char_interval;
                    if let Some(state) = self.state.as_mut() {
                        state.is_playing = true;
                    }
                }
                None
            }
            AudioEvent::Ended => Some(self.complete()),
            AudioEvent::Error(reason) => Some(self.fail(&reason)),
        }
    }

    /// Reveals at most one more char once its time has come, then fires
    /// markers for the new reveal count.
    pub fn reveal_tick(&mut self, now: Duration) {
        if self.phase != Phase::Playing || now < self.next_reveal {
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.cancel_requested || state.revealed_char_count >= state.text_len {
            return;
        }

        state.revealed_char_count += 1;
        self.next_reveal += self.char_interval;
        let revealed = state.revealed_char_count;
        let window = self.config.trigger_window;

        let due = state
            .markers
            .iter()
            .rposition(|m| m.position <= revealed && revealed <= m.position + window);
        let mut to_fire: Vec<EmotionMarker> = due.map(|i| state.markers.remove(i)).into_iter().collect();

        if revealed + 1 >= state.text_len && !state.markers.is_empty() {
            debug!("End of text reached, flushing {} markers", state.markers.len());
            to_fire.append(&mut state.markers);
        }

        let subtitle = format!(
            "{}: {}{}",
            self.subtitle_label,
            self.displayed_text,
            state.revealed_text()
        );

        for marker in to_fire {
            self.fire(marker);
        }
        self.events.emit(PresenterEvent::Subtitle(subtitle));
    }

    /// Forwards the mouth value for the current analysis buffer.
    pub fn amplitude_tick(&mut self, bins: &[u8]) {
        if self.phase != Phase::Playing {
            return;
        }
        if self.state.as_ref().is_some_and(|s| s.cancel_requested) {
            return;
        }
        self.renderer.set_mouth_open(mouth_value(bins));
    }

    fn fire(&mut self, marker: EmotionMarker) {
        match marker.kind {
            MarkerKind::Emotion => {
                self.mapper.borrow_mut().trigger_by_emotion(&marker.emotion);
            }
            MarkerKind::Expression => {
                self.mapper.borrow_mut().trigger_expression(&marker.emotion);
            }
        }
        if let Some(state) = self.state.as_mut() {
            state.fired.push(marker);
        }
    }

    fn complete(&mut self) -> PlaybackOutcome {
        let pending = self
            .state
            .as_mut()
            .map(|s| std::mem::take(&mut s.markers))
            .unwrap_or_default();
        for marker in pending {
            self.fire(marker);
        }

        self.renderer.set_mouth_open(0.0);

        if let Some(state) = self.state.take() {
            self.displayed_text.push_str(&state.stripped_text);
            if self.config.settle {
                self.settle_queue = state
                    .fired
                    .into_iter()
                    .filter(|m| m.kind == MarkerKind::Emotion)
                    .map(|m| m.emotion)
                    .collect();
            }
        }
        self.events.emit(PresenterEvent::Subtitle(format!(
            "{}: {}",
            self.subtitle_label, self.displayed_text
        )));

        info!("Segment completed");
        self.finish(PlaybackOutcome::Completed)
    }

    /// Ends the segment after an audio failure and falls back to the default
    /// expression.
    pub fn fail(&mut self, reason: &str) -> PlaybackOutcome {
        if self.phase == Phase::Idle {
            return PlaybackOutcome::Errored(reason.to_string());
        }
        error!("Playback failed: {}", reason);

        self.mapper.borrow().play_default_expression();
        self.renderer.set_mouth_open(0.0);
        self.state = None;
        self.events
            .fault(SyncError::PlaybackFailure(reason.to_string()));
        self.finish(PlaybackOutcome::Errored(reason.to_string()))
    }

    /// Cancels the live segment and any pending settle trigger. Returns the
    /// outcome if a segment was live.
    pub fn stop(&mut self) -> Option<PlaybackOutcome> {
        self.settle_queue.clear();
        let state = self.state.as_mut()?;
        state.cancel_requested = true;

        info!("Playback stopped");
        self.renderer.set_mouth_open(0.0);
        Some(self.finish(PlaybackOutcome::Stopped))
    }

    /// Stops and forgets the text shown so far.
    pub fn reset(&mut self) {
        self.stop();
        self.displayed_text.clear();
    }

    fn finish(&mut self, outcome: PlaybackOutcome) -> PlaybackOutcome {
        self.release();
        self.events.emit(PresenterEvent::TtsEnd {
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Back to idle. Safe to call any number of times.
    pub fn release(&mut self) {
        self.phase = Phase::Idle;
        self.state = None;
        self.next_reveal = Duration::ZERO;
    }

    pub fn has_pending_settle(&self) -> bool {
        !self.settle_queue.is_empty()
    }

    /// Re-triggers every emotion fired during the last completed segment.
    pub fn settle(&mut self) {
        let emotions = std::mem::take(&mut self.settle_queue);
        if emotions.is_empty() {
            return;
        }
        debug!("Settling {} emotions", emotions.len());
        let mut mapper = self.mapper.borrow_mut();
        for emotion in emotions {
            mapper.trigger_by_emotion(&emotion);
        }
    }
}
