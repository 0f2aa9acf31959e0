//! In-text emotion tags.
//!
//! Tags look like `<label>` or `<expression:label>`, where the label is any
//! run of non-`>` characters. Positions are char offsets.

use crate::core::events::EventBus;
use crate::core::error::SyncError;
use crate::core::state::{EmotionMarker, ExpressionConfig, MarkerKind};
use log::warn;
use regex::{CaptureMatches, Regex};
use std::sync::LazyLock;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("tag pattern is valid"));

const EXPRESSION_PREFIX: &str = "expression:";

/// A tag occurrence in the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag<'a> {
    pub label: &'a str,
    pub kind: MarkerKind,
    /// Char offset of `<` in the original text.
    pub start: usize,
    /// Char offset just past `>` in the original text.
    pub end: usize,
    /// Char offset of the tag in the text with all tags removed.
    pub position: usize,
}

impl Tag<'_> {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Lazy scan over the tags of a text. Each call to [`tags`] starts a fresh pass.
pub struct Tags<'a> {
    text: &'a str,
    matches: CaptureMatches<'static, 'a>,
    last_byte: usize,
    original_chars: usize,
    stripped_chars: usize,
}

pub fn tags(text: &str) -> Tags<'_> {
    Tags {
        text,
        matches: TAG_PATTERN.captures_iter(text),
        last_byte: 0,
        original_chars: 0,
        stripped_chars: 0,
    }
}

impl<'a> Iterator for Tags<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let caps = self.matches.next()?;
        let whole = caps.get(0)?;
        let raw_label = caps.get(1)?.as_str();

        let gap = self.text[self.last_byte..whole.start()].chars().count();
        let tag_chars = whole.as_str().chars().count();

        let start = self.original_chars + gap;
        let position = self.stripped_chars + gap;

        self.original_chars = start + tag_chars;
        self.stripped_chars = position;
        self.last_byte = whole.end();

        let (label, kind) = match raw_label.strip_prefix(EXPRESSION_PREFIX) {
            Some(name) if !name.is_empty() => (name, MarkerKind::Expression),
            _ => (raw_label, MarkerKind::Emotion),
        };

        Some(Tag {
            label,
            kind,
            start,
            end: start + tag_chars,
            position,
        })
    }
}

/// Removes every tag, keeping all other characters in order.
pub fn strip_tags(text: &str) -> String {
    TAG_PATTERN.replace_all(text, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    pub text: String,
    pub markers: Vec<EmotionMarker>,
}

/// Strips tags and builds markers for the labels `config` knows about.
///
/// Tags with unknown labels are still stripped but produce no marker.
pub fn prepare_text(text: &str, config: &ExpressionConfig, events: Option<&EventBus>) -> PreparedText {
    let mut markers = Vec::new();

    for tag in tags(text) {
        match config.get(tag.label) {
            Some(files) => markers.push(EmotionMarker {
                position: tag.position,
                emotion: tag.label.to_string(),
                kind: tag.kind,
                candidate_assets: files.to_vec(),
            }),
            None => {
                warn!("No expression configured for tag <{}>, dropping marker", tag.label);
                if let Some(events) = events {
                    events.fault(SyncError::MalformedMarker(tag.label.to_string()));
                }
            }
        }
    }

    PreparedText {
        text: strip_tags(text),
        markers,
    }
}
