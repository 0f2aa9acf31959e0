use super::{AudioEvent, AudioSource};
use crate::utils::audio::{decode_wav, PcmAudio};
use crate::utils::clock::Clock;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// PCM16 WAV clip played against a clock rather than a sound device.
///
/// `Ended` fires once the clip's duration has elapsed on the tokio timer.
pub struct WavClip {
    bytes: Option<Vec<u8>>,
    audio: Option<PcmAudio>,
    clock: Rc<dyn Clock>,
    started_at: Option<Duration>,
    tx: Option<mpsc::UnboundedSender<AudioEvent>>,
    end_timer: Option<JoinHandle<()>>,
}

impl WavClip {
    pub fn new(bytes: Vec<u8>, clock: Rc<dyn Clock>) -> Self {
        Self {
            bytes: Some(bytes),
            audio: None,
            clock,
            started_at: None,
            tx: None,
            end_timer: None,
        }
    }

    fn send(&self, event: AudioEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("audio event dropped, listener gone");
            }
        }
    }
}

impl AudioSource for WavClip {
    fn open(&mut self) -> mpsc::UnboundedReceiver<AudioEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);

        let decoded = match &self.bytes {
            Some(bytes) => decode_wav(bytes),
            None => Err(anyhow!("clip already released")),
        };
        match decoded {
            Ok(audio) => {
                let duration = audio.duration();
                self.audio = Some(audio);
                self.send(AudioEvent::Ready { duration });
            }
            Err(e) => {
                warn!("Failed to decode clip: {:#}", e);
                self.send(AudioEvent::Error(format!("{:#}", e)));
            }
        }
        rx
    }

    fn play(&mut self) -> Result<()> {
        let audio = self
            .audio
            .as_ref()
            .ok_or_else(|| anyhow!("clip is not decoded"))?;
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| anyhow!("clip is not open"))?;
        let duration = audio.duration();

        self.started_at = Some(self.clock.now());
        self.send(AudioEvent::Play);

        self.end_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(AudioEvent::Ended);
        }));
        Ok(())
    }

    fn frequency_data(&mut self, out: &mut [u8]) {
        match (&self.audio, self.started_at) {
            (Some(audio), Some(start)) => {
                let position = self.clock.now().saturating_sub(start);
                audio.level_bins(position, out);
            }
            _ => out.fill(0),
        }
    }

    fn release(&mut self) {
        if let Some(timer) = self.end_timer.take() {
            timer.abort();
        }
        self.tx = None;
        self.audio = None;
        self.bytes = None;
        self.started_at = None;
    }
}

impl Drop for WavClip {
    fn drop(&mut self) {
        self.release();
    }
}
