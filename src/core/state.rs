use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Emotion categories every character config starts with. These labels are
/// never picked as a fallback display expression.
pub const EMOTION_CATEGORIES: [&str; 6] = ["开心", "生气", "难过", "惊讶", "害羞", "俏皮"];

/// Emotion label -> expression files, in insertion order.
///
/// An emotion with an empty list is known but unbound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpressionConfig {
    entries: Vec<(String, Vec<String>)>,
}

impl ExpressionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in config used when the store has nothing for a character.
    pub fn with_default_categories() -> Self {
        let mut config = Self::new();
        for emotion in EMOTION_CATEGORIES {
            config.insert(emotion, Vec::new());
        }
        config
    }

    pub fn get(&self, emotion: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == emotion)
            .map(|(_, files)| files.as_slice())
    }

    /// Bound files for `emotion`, or `None` when unknown or unbound.
    pub fn bound(&self, emotion: &str) -> Option<&[String]> {
        self.get(emotion).filter(|files| !files.is_empty())
    }

    pub fn contains(&self, emotion: &str) -> bool {
        self.get(emotion).is_some()
    }

    pub fn get_mut(&mut self, emotion: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == emotion)
            .map(|(_, files)| files)
    }

    pub fn get_or_insert(&mut self, emotion: &str) -> &mut Vec<String> {
        let idx = match self.entries.iter().position(|(k, _)| k == emotion) {
            Some(idx) => idx,
            None => {
                self.entries.push((emotion.to_string(), Vec::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }

    /// Replaces the files of an existing key in place, or appends a new key.
    pub fn insert(&mut self, emotion: &str, files: Vec<String>) {
        *self.get_or_insert(emotion) = files;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, files)| (k.as_str(), files.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ExpressionConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (emotion, files) in &self.entries {
            map.serialize_entry(emotion, files)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExpressionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = ExpressionConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of emotion labels to expression file lists")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Self::Value, M::Error> {
                let mut config = ExpressionConfig::new();
                while let Some((emotion, files)) = access.next_entry::<String, Vec<String>>()? {
                    config.insert(&emotion, files);
                }
                Ok(config)
            }
        }

        deserializer.deserialize_map(ConfigVisitor)
    }
}

/// One character's record in the persisted document.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct CharacterRecord {
    #[serde(default)]
    pub emotion_expressions: ExpressionConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterSession {
    pub character_id: String,
    pub expression_config: ExpressionConfig,
    pub default_expression: String,
}

impl CharacterSession {
    pub fn new(character_id: &str, expression_config: ExpressionConfig, default_expression: &str) -> Self {
        Self {
            character_id: character_id.to_string(),
            expression_config,
            default_expression: default_expression.to_string(),
        }
    }
}

/// Extracts `<id>` from a model path of the form `<root>/<id>/<file>`.
///
/// The convention may appear anywhere in the path, so URLs such as
/// `http://host/2D/肥牛/model.model3.json` also match.
pub fn character_id_from_model_path(model_path: &str, root: &str) -> Option<String> {
    let parts: Vec<&str> = model_path.split('/').collect();
    parts
        .windows(3)
        .find(|w| w[0] == root && !w[1].is_empty())
        .map(|w| w[1].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `<label>`: fires through emotion resolution.
    Emotion,
    /// `<expression:label>`: fires the named expression directly.
    Expression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmotionMarker {
    /// Char offset into the stripped text.
    pub position: usize,
    pub emotion: String,
    pub kind: MarkerKind,
    pub candidate_assets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
    Errored(String),
    /// Refused because another segment was live.
    Skipped,
}

impl PlaybackOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PlaybackOutcome::Completed)
    }
}

/// Per-segment playback state. Lives from `begin` until a terminal transition.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub segment_text: String,
    pub stripped_text: String,
    /// Length of `stripped_text` in chars.
    pub text_len: usize,
    /// Pending markers, position-sorted.
    pub markers: Vec<EmotionMarker>,
    pub fired: Vec<EmotionMarker>,
    pub revealed_char_count: usize,
    pub is_playing: bool,
    pub cancel_requested: bool,
}

impl PlaybackState {
    pub fn new(segment_text: &str, stripped_text: String, markers: Vec<EmotionMarker>) -> Self {
        let text_len = stripped_text.chars().count();
        Self {
            segment_text: segment_text.to_string(),
            stripped_text,
            text_len,
            markers,
            fired: Vec::new(),
            revealed_char_count: 0,
            is_playing: false,
            cancel_requested: false,
        }
    }

    pub fn revealed_text(&self) -> String {
        self.stripped_text
            .chars()
            .take(self.revealed_char_count)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_preserves_insertion_order() -> anyhow::Result<()> {
        let json = r#"{"生气": [], "开心": ["expressions/a.exp3.json"], "表情1": ["expressions/expression1.exp3.json"]}"#;
        let config: ExpressionConfig = serde_json::from_str(json)?;

        let keys: Vec<&str> = config.keys().collect();
        assert_eq!(keys, vec!["生气", "开心", "表情1"]);
        assert!(config.contains("生气"));
        assert!(config.bound("生气").is_none());
        assert_eq!(config.bound("开心").unwrap(), ["expressions/a.exp3.json"]);

        let back = serde_json::to_string(&config)?;
        assert!(back.find("生气").unwrap() < back.find("开心").unwrap());
        Ok(())
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut config = ExpressionConfig::with_default_categories();
        config.insert("难过", vec!["expressions/sad.exp3.json".to_string()]);

        assert_eq!(config.len(), EMOTION_CATEGORIES.len());
        assert_eq!(config.keys().nth(2), Some("难过"));
    }

    #[test]
    fn test_character_id_from_model_path() {
        assert_eq!(
            character_id_from_model_path("2D/肥牛/hiyori_pro_mic.model3.json", "2D").as_deref(),
            Some("肥牛")
        );
        assert_eq!(
            character_id_from_model_path("http://localhost/2D/橘色女生/mgirl.model3.json", "2D").as_deref(),
            Some("橘色女生")
        );
        assert_eq!(character_id_from_model_path("models/hiyori.model3.json", "2D"), None);
        assert_eq!(character_id_from_model_path("2D/model3.json", "2D"), None);
    }

    #[test]
    fn test_revealed_text_counts_chars() {
        let mut state = PlaybackState::new("你好", "你好".to_string(), vec![]);
        state.revealed_char_count = 1;
        assert_eq!(state.text_len, 2);
        assert_eq!(state.revealed_text(), "你");
    }
}
