use anyhow::{anyhow, Result};
use log::{debug, info};
use std::collections::HashMap;

/// The model renderer. Failures are logged by callers and never escalate.
pub trait Renderer {
    /// Applies an expression by its asset id (file stem, e.g. `expression3`).
    fn select_expression(&self, asset_id: &str) -> Result<()>;
    fn select_motion(&self, group: &str, index: usize) -> Result<()>;
    /// Number of motions in `group`, or `None` if the group is unknown.
    fn motion_count(&self, group: &str) -> Option<usize>;
    /// Mouth openness in `0.0..=1.0`.
    fn set_mouth_open(&self, value: f32);
}

/// Renderer that only logs what it is asked to do. Used by the binary.
#[derive(Debug, Default)]
pub struct LogRenderer {
    motions: HashMap<String, usize>,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_motion_group(mut self, group: &str, count: usize) -> Self {
        self.motions.insert(group.to_string(), count);
        self
    }
}

impl Renderer for LogRenderer {
    fn select_expression(&self, asset_id: &str) -> Result<()> {
        info!("expression -> {}", asset_id);
        Ok(())
    }

    fn select_motion(&self, group: &str, index: usize) -> Result<()> {
        if !self.motions.contains_key(group) {
            return Err(anyhow!("Unknown motion group: {}", group));
        }
        info!("motion -> {}[{}]", group, index);
        Ok(())
    }

    fn motion_count(&self, group: &str) -> Option<usize> {
        self.motions.get(group).copied()
    }

    fn set_mouth_open(&self, value: f32) {
        debug!("mouth -> {:.3}", value);
    }
}
