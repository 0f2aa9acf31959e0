use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub character: CharacterConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub subtitle: SubtitleConfig,

    /// Segments played by the demo binary, in order.
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CharacterConfig {
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_model_root")]
    pub model_root: String,
    #[serde(default = "default_fallback_id")]
    pub fallback_id: String,
    #[serde(default = "default_expression")]
    pub default_expression: String,
    #[serde(default = "default_motion_group")]
    pub motion_group: String,
    /// Motions the model has in `motion_group`.
    #[serde(default)]
    pub motion_count: usize,
    #[serde(default)]
    pub idle_motion: Option<usize>,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            model_root: default_model_root(),
            fallback_id: default_fallback_id(),
            default_expression: default_expression(),
            motion_group: default_motion_group(),
            motion_count: 0,
            idle_motion: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            cache_path: default_cache_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaybackConfig {
    #[serde(default = "default_min_char_interval")]
    pub min_char_interval_ms: u64,
    #[serde(default = "default_max_char_interval")]
    pub max_char_interval_ms: u64,
    /// Chars past a marker's position within which it may still fire.
    #[serde(default = "default_trigger_window")]
    pub trigger_window: usize,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_true")]
    pub settle: bool,
    #[serde(default = "default_fft_bins")]
    pub fft_bins: usize,
}

impl PlaybackConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Per-char reveal interval for an utterance, clamped so short and long
    /// clips both animate legibly.
    pub fn char_interval(&self, audio_duration: Duration, text_len: usize) -> Duration {
        let min = self.min_char_interval_ms as f64;
        let max = (self.max_char_interval_ms as f64).max(min);
        let raw = if text_len == 0 {
            max
        } else {
            audio_duration.as_secs_f64() * 1000.0 / text_len as f64
        };
        Duration::from_micros((raw.clamp(min, max) * 1000.0).round() as u64)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_char_interval_ms: default_min_char_interval(),
            max_char_interval_ms: default_max_char_interval(),
            trigger_window: default_trigger_window(),
            frame_interval_ms: default_frame_interval(),
            settle_delay_ms: default_settle_delay(),
            settle: true,
            fft_bins: default_fft_bins(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubtitleConfig {
    #[serde(default = "default_subtitle_label")]
    pub label: String,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            label: default_subtitle_label(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SegmentConfig {
    pub text: String,
    /// Path to a PCM16 WAV file.
    pub audio: String,
}

fn default_model_root() -> String {
    "2D".to_string()
}
fn default_fallback_id() -> String {
    "肥牛".to_string()
}
fn default_expression() -> String {
    "表情1".to_string()
}
fn default_motion_group() -> String {
    "TapBody".to_string()
}
fn default_store_path() -> String {
    "emotion_expressions.json".to_string()
}
fn default_cache_path() -> String {
    "cache/expression_configs.json".to_string()
}
fn default_min_char_interval() -> u64 {
    30
}
fn default_max_char_interval() -> u64 {
    200
}
fn default_trigger_window() -> usize {
    2
}
fn default_frame_interval() -> u64 {
    16
}
fn default_settle_delay() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_fft_bins() -> usize {
    128
}
fn default_subtitle_label() -> String {
    "Fake Neuro".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for file in [&self.store.path, &self.store.cache_path] {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() -> Result<()> {
        let config: Config = serde_yaml_ng::from_str("character:\n  model_path: 2D/肥牛/a.model3.json\n")?;

        assert_eq!(config.character.model_path, "2D/肥牛/a.model3.json");
        assert_eq!(config.character.default_expression, "表情1");
        assert_eq!(config.store.path, "emotion_expressions.json");
        assert_eq!(config.playback.trigger_window, 2);
        assert!(config.playback.settle);
        assert_eq!(config.subtitle.label, "Fake Neuro");
        assert!(config.segments.is_empty());
        Ok(())
    }

    #[test]
    fn test_char_interval_is_clamped() {
        let playback = PlaybackConfig::default();

        // 1s over 10 chars -> 100ms, inside the range
        assert_eq!(
            playback.char_interval(Duration::from_secs(1), 10),
            Duration::from_millis(100)
        );
        // very short clip
        assert_eq!(
            playback.char_interval(Duration::from_millis(100), 50),
            Duration::from_millis(30)
        );
        // very long clip
        assert_eq!(
            playback.char_interval(Duration::from_secs(60), 3),
            Duration::from_millis(200)
        );
        assert_eq!(
            playback.char_interval(Duration::from_secs(1), 0),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");

        let mut config = Config::default();
        config.subtitle.label = "Neuro".to_string();
        config.segments.push(SegmentConfig {
            text: "你好<开心>".to_string(),
            audio: "a.wav".to_string(),
        });
        config.save(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.subtitle.label, "Neuro");
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.segments[0].text, "你好<开心>");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load_from("/nonexistent/config.yml").is_err());
    }
}
