use crate::core::config::Config;
use crate::core::state::PlaybackOutcome;
use crate::services::audio::{AudioEvent, AudioSource};
use crate::services::expression::SharedMapper;
use crate::services::playback::PlaybackEngine;
use crate::services::render::Renderer;
use crate::utils::clock::Clock;
use log::{debug, info};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Cooperative cancellation for the segment a [`Presenter`] is playing.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Consumes a pending request.
    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

/// Plays segments one at a time: runs the audio source, the reveal and
/// amplitude ticks and the settle grace period around a [`PlaybackEngine`].
pub struct Presenter {
    engine: PlaybackEngine,
    clock: Rc<dyn Clock>,
    stop: StopHandle,
    frame_interval: Duration,
    settle_delay: Duration,
    fft_bins: usize,
}

impl Presenter {
    pub fn new(mapper: SharedMapper, renderer: Rc<dyn Renderer>, clock: Rc<dyn Clock>, config: &Config) -> Self {
        let playback = config.playback.clone();
        Self {
            frame_interval: playback.frame_interval(),
            settle_delay: playback.settle_delay(),
            fft_bins: playback.fft_bins.max(1),
            engine: PlaybackEngine::new(mapper, renderer, playback, &config.subtitle.label),
            clock,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing()
    }

    /// Stops whatever is playing, drops any pending stop request and clears
    /// the subtitle text.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.stop.take();
    }

    /// Plays `audio` with `text`, revealing the text and firing its emotion
    /// tags as the audio progresses. Never fails; problems are reported
    /// through the outcome and the event bus.
    ///
    /// A stop requested while nothing was playing is consumed here: the
    /// segment is not started and `Stopped` is returned.
    pub async fn play_audio(&mut self, audio: &mut dyn AudioSource, text: &str) -> PlaybackOutcome {
        if self.stop.take() {
            info!("Stop was requested before playback, not starting segment");
            return PlaybackOutcome::Stopped;
        }
        if !self.engine.begin(text) {
            return PlaybackOutcome::Skipped;
        }

        let mut audio_events = audio.open();
        let mut reveal = interval(self.frame_interval);
        reveal.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut amplitude = interval(self.frame_interval);
        amplitude.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bins = vec![0u8; self.fft_bins];

        let outcome = loop {
            if self.stop.take() {
                break self.engine.stop().unwrap_or(PlaybackOutcome::Stopped);
            }

            tokio::select! {
                _ = self.stop.notify.notified() => {}
                event = audio_events.recv() => {
                    let Some(event) = event else {
                        break self.engine.fail("audio source closed unexpectedly");
                    };
                    let ready = matches!(event, AudioEvent::Ready { .. });
                    if let Some(outcome) = self.engine.on_audio_event(event, self.clock.now()) {
                        break outcome;
                    }
                    if ready {
                        if let Err(e) = audio.play() {
                            break self.engine.fail(&format!("{:#}", e));
                        }
                    }
                }
                _ = reveal.tick() => self.engine.reveal_tick(self.clock.now()),
                _ = amplitude.tick() => {
                    audio.frequency_data(&mut bins);
                    self.engine.amplitude_tick(&bins);
                }
            }
        };

        drop(audio_events);
        audio.release();
        info!("Segment finished: {:?}", outcome);

        if outcome.is_completed() && self.engine.has_pending_settle() {
            self.settle().await;
        }
        outcome
    }

    async fn settle(&mut self) {
        debug!("Settling after {:?}", self.settle_delay);
        tokio::select! {
            _ = sleep(self.settle_delay) => {}
            _ = self.stop.notify.notified() => {}
        }
        if self.stop.take() {
            self.engine.stop();
        } else {
            self.engine.settle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventBus, PresenterEvent};
    use crate::core::state::{CharacterSession, ExpressionConfig};
    use crate::services::audio::WavClip;
    use crate::services::expression::ExpressionMapper;
    use crate::services::render::testing::RecordingRenderer;
    use crate::utils::audio::tests::create_dummy_wav;
    use crate::utils::clock::TokioClock;
    use anyhow::{anyhow, Result};
    use tokio::sync::{broadcast, mpsc};

    fn file(name: &str) -> String {
        format!("expressions/{}.exp3.json", name)
    }

    fn presenter() -> (Presenter, Rc<RecordingRenderer>, broadcast::Receiver<PresenterEvent>) {
        let mut config = ExpressionConfig::with_default_categories();
        config.insert("表情1", vec![file("expression1")]);
        config.insert("开心", vec![file("happy")]);
        config.insert("生气", vec![file("angry")]);

        let renderer = Rc::new(RecordingRenderer::default());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mapper = ExpressionMapper::new(CharacterSession::new("肥牛", config, "表情1"), renderer.clone(), bus)
            .into_shared();
        let presenter = Presenter::new(mapper, renderer.clone(), Rc::new(TokioClock::new()), &Config::default());
        (presenter, renderer, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<PresenterEvent>) -> Vec<PresenterEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// 1s of loud mono audio at 8kHz.
    fn loud_clip() -> WavClip {
        WavClip::new(create_dummy_wav(&vec![12000i16; 8000], 8000), Rc::new(TokioClock::new()))
    }

    /// Source that decodes fine but cannot start the device.
    #[derive(Default)]
    struct BusySource {
        tx: Option<mpsc::UnboundedSender<AudioEvent>>,
        released: usize,
    }

    impl AudioSource for BusySource {
        fn open(&mut self) -> mpsc::UnboundedReceiver<AudioEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(AudioEvent::Ready {
                duration: Duration::from_secs(1),
            });
            self.tx = Some(tx);
            rx
        }

        fn play(&mut self) -> Result<()> {
            Err(anyhow!("device busy"))
        }

        fn frequency_data(&mut self, out: &mut [u8]) {
            out.fill(0);
        }

        fn release(&mut self) {
            self.released += 1;
            self.tx = None;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_segment_to_completion() {
        let (mut presenter, renderer, mut rx) = presenter();
        let mut clip = loud_clip();

        let outcome = presenter.play_audio(&mut clip, "你好<开心>今天天气<生气>不错").await;

        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert!(!presenter.is_playing());
        // both markers fire during playback, then settle re-applies them
        assert_eq!(renderer.expressions(), vec!["happy", "angry", "happy", "angry"]);
        assert!(renderer.mouth.borrow().iter().any(|&m| m > 0.0));
        assert_eq!(renderer.last_mouth(), Some(0.0));
        assert_eq!(presenter.engine().displayed_text(), "你好今天天气不错");

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&PresenterEvent::TtsStart));
        assert!(events.contains(&PresenterEvent::Subtitle("Fake Neuro: 你好今天天气不错".to_string())));
        assert!(events.contains(&PresenterEvent::TtsEnd {
            outcome: PlaybackOutcome::Completed
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_segment() {
        let (mut presenter, renderer, mut rx) = presenter();
        let stop = presenter.stop_handle();
        let mut clip = loud_clip();

        let outcome = {
            let play = presenter.play_audio(&mut clip, "你好<开心>今天天气<生气>不错");
            let stopper = async {
                sleep(Duration::from_millis(100)).await;
                stop.stop();
            };
            let (outcome, _) = tokio::join!(play, stopper);
            outcome
        };

        assert_eq!(outcome, PlaybackOutcome::Stopped);
        assert!(renderer.expressions().is_empty());
        assert_eq!(renderer.last_mouth(), Some(0.0));
        assert!(drain(&mut rx).contains(&PresenterEvent::TtsEnd {
            outcome: PlaybackOutcome::Stopped
        }));

        // a stale stop does not leak into the next segment
        let mut clip = loud_clip();
        assert_eq!(presenter.play_audio(&mut clip, "再见").await, PlaybackOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_play_is_honoured_once() {
        let (mut presenter, renderer, mut rx) = presenter();
        presenter.stop_handle().stop();

        let mut clip = loud_clip();
        assert_eq!(presenter.play_audio(&mut clip, "<开心>你好").await, PlaybackOutcome::Stopped);
        assert!(renderer.expressions().is_empty());
        assert!(!drain(&mut rx).contains(&PresenterEvent::TtsStart));
        assert!(!presenter.stop_handle().is_requested());

        let mut clip = loud_clip();
        assert_eq!(presenter.play_audio(&mut clip, "再见").await, PlaybackOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_pending_stop() {
        let (mut presenter, _renderer, _rx) = presenter();
        presenter.stop_handle().stop();
        presenter.reset();

        let mut clip = loud_clip();
        assert_eq!(presenter.play_audio(&mut clip, "再见").await, PlaybackOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_settle_cancels_it() {
        let (mut presenter, renderer, _rx) = presenter();
        let stop = presenter.stop_handle();
        let mut clip = loud_clip();

        let outcome = {
            let play = presenter.play_audio(&mut clip, "<开心>你好");
            let stopper = async {
                // audio ends at 1s, settle would fire 100ms later
                sleep(Duration::from_millis(1050)).await;
                stop.stop();
            };
            let (outcome, _) = tokio::join!(play, stopper);
            outcome
        };

        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(renderer.expressions(), vec!["happy"]);
        assert!(!presenter.engine().has_pending_settle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_plays_default() {
        let (mut presenter, renderer, mut rx) = presenter();
        let mut clip = WavClip::new(b"not audio".to_vec(), Rc::new(TokioClock::new()));

        let outcome = presenter.play_audio(&mut clip, "<开心>你好").await;

        assert!(matches!(outcome, PlaybackOutcome::Errored(_)));
        assert_eq!(renderer.expressions(), vec!["expression1"]);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PresenterEvent::Fault(crate::core::error::SyncError::PlaybackFailure(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_failure_releases_source() {
        let (mut presenter, renderer, _rx) = presenter();
        let mut source = BusySource::default();

        let outcome = presenter.play_audio(&mut source, "你好").await;

        assert_eq!(outcome, PlaybackOutcome::Errored("device busy".to_string()));
        assert_eq!(source.released, 1);
        assert!(source.tx.is_none());
        assert_eq!(renderer.expressions(), vec!["expression1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_play_is_skipped() {
        let (mut presenter, _renderer, _rx) = presenter();
        presenter.engine.begin("占用中");

        let mut clip = loud_clip();
        assert_eq!(presenter.play_audio(&mut clip, "你好").await, PlaybackOutcome::Skipped);
        assert!(presenter.is_playing());

        presenter.reset();
        assert!(!presenter.is_playing());
    }
}
