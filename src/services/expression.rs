//! Emotion -> expression resolution for one character.

use crate::core::error::SyncError;
use crate::core::events::{EventBus, PresenterEvent};
use crate::core::state::{CharacterSession, ExpressionConfig, EMOTION_CATEGORIES};
use crate::services::render::Renderer;
use crate::services::store::{ExpressionStore, PersistHandle};
use crate::services::tags::{prepare_text, PreparedText};
use log::{debug, error, info, warn};
use rand::seq::IndexedRandom;
use rand::RngCore;
use regex::Regex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::LazyLock;

pub const EXPRESSION_SUFFIX: &str = ".exp3.json";
pub const EXPRESSION_DIR: &str = "expressions";

/// Names tried, in order, after the configured default.
const PRIMARY_EXPRESSIONS: [&str; 2] = ["表情1", "默认表情"];
const DEFAULT_EXPRESSION_ALIAS: &str = "默认表情";

static CONVENTIONAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^expression\d+$").expect("naming pattern is valid"));

/// Mapper shared between the presenter and the UI shell on one thread.
pub type SharedMapper = Rc<RefCell<ExpressionMapper>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionBinding {
    pub file: String,
    pub name: String,
}

pub struct ExpressionMapper {
    session: CharacterSession,
    renderer: Rc<dyn Renderer>,
    events: EventBus,
    rng: Box<dyn RngCore>,
    persister: Option<PersistHandle>,
    motion_group: String,
}

/// `expressions/expression3.exp3.json` -> `expression3`
pub fn asset_id_from_file(file: &str) -> &str {
    let name = file.rsplit('/').next().unwrap_or(file);
    name.strip_suffix(EXPRESSION_SUFFIX).unwrap_or(name)
}

/// `expressions/expression3.exp3.json` -> `表情3`; other stems pass through.
pub fn display_name_from_file(file: &str) -> String {
    let stem = asset_id_from_file(file);
    match stem.strip_prefix("expression") {
        Some(num) if !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) => {
            format!("表情{}", num)
        }
        _ => stem.to_string(),
    }
}

fn is_reserved(name: &str) -> bool {
    EMOTION_CATEGORIES.contains(&name)
}

impl ExpressionMapper {
    pub fn new(session: CharacterSession, renderer: Rc<dyn Renderer>, events: EventBus) -> Self {
        Self {
            session,
            renderer,
            events,
            rng: Box::new(rand::rng()),
            persister: None,
            motion_group: "TapBody".to_string(),
        }
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore>) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_persister(mut self, persister: PersistHandle) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn with_motion_group(mut self, group: &str) -> Self {
        self.motion_group = group.to_string();
        self
    }

    pub fn into_shared(self) -> SharedMapper {
        Rc::new(RefCell::new(self))
    }

    pub fn character_id(&self) -> &str {
        &self.session.character_id
    }

    pub fn config(&self) -> &ExpressionConfig {
        &self.session.expression_config
    }

    pub fn default_expression(&self) -> &str {
        &self.session.default_expression
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Hands the persister back so the caller can flush it outside any borrow.
    pub fn take_persister(&mut self) -> Option<PersistHandle> {
        self.persister.take()
    }

    pub fn prepare_text(&self, text: &str) -> PreparedText {
        let prepared = prepare_text(text, self.config(), Some(&self.events));
        debug!(
            "'{}': {} expression markers",
            self.session.character_id,
            prepared.markers.len()
        );
        prepared
    }

    /// Looks up an expression file for a name that may not be a config key:
    /// first its normalized variants, then a conventional asset path.
    pub fn find_expression_file(&self, name: &str) -> Option<String> {
        let config = self.config();
        let variants = [
            name.to_string(),
            name.replace("表情", "expression"),
            name.replace("Expression", "expression"),
        ];

        for variant in &variants {
            if let Some(files) = config.bound(variant) {
                return files.first().cloned();
            }
        }

        let normalized = &variants[1].replace("Expression", "expression");
        if CONVENTIONAL_NAME.is_match(normalized) {
            return Some(format!("{}/{}{}", EXPRESSION_DIR, normalized, EXPRESSION_SUFFIX));
        }
        None
    }

    /// Resolves an emotion to one expression file.
    ///
    /// Multiple bound candidates are chosen between uniformly at random.
    pub fn resolve(&mut self, emotion: &str) -> Option<String> {
        if let Some(files) = self.session.expression_config.bound(emotion) {
            return files.choose(&mut *self.rng).cloned();
        }
        self.find_expression_file(emotion)
    }

    /// Plays an expression for `emotion`, or the default chain if nothing
    /// resolves. Returns the selected file.
    pub fn trigger_by_emotion(&mut self, emotion: &str) -> Option<String> {
        let Some(file) = self.resolve(emotion) else {
            info!("Emotion '{}' has no bound expression, playing default", emotion);
            self.events
                .fault(SyncError::UnresolvedEmotion(emotion.to_string()));
            self.play_default_expression();
            return None;
        };

        let expression = display_name_from_file(&file);
        self.play_expression_file(&file);
        info!("Emotion '{}' -> {} ({})", emotion, expression, file);

        self.events.emit(PresenterEvent::ExpressionTriggered {
            emotion: emotion.to_string(),
            expression,
            file: file.clone(),
        });
        Some(file)
    }

    /// Plays a named expression. Unknown or unbound names play the default
    /// chain and return false.
    pub fn trigger_expression(&mut self, name: &str) -> bool {
        if name == DEFAULT_EXPRESSION_ALIAS || name == self.session.default_expression {
            self.play_default_expression();
            return true;
        }

        let Some(files) = self.session.expression_config.get(name) else {
            warn!("Expression '{}' is not configured, using default", name);
            self.play_default_expression();
            return false;
        };
        let Some(file) = files.choose(&mut *self.rng).cloned() else {
            warn!("Expression '{}' has no files, using default", name);
            self.play_default_expression();
            return false;
        };

        self.play_expression_file(&file);
        info!("Expression {} -> {}", name, file);
        self.events.emit(PresenterEvent::ExpressionPlayed {
            expression: name.to_string(),
            file,
        });
        true
    }

    /// Plays the first available of: the configured default, the primary
    /// names, then any bound expression that is not an emotion category.
    /// Returns the played file.
    pub fn play_default_expression(&self) -> Option<String> {
        let file = self.default_expression_file();
        match &file {
            Some(file) => {
                debug!("Default expression -> {}", file);
                self.play_expression_file(file);
            }
            None => warn!("No default expression available"),
        }
        file
    }

    fn default_expression_file(&self) -> Option<String> {
        let config = self.config();
        let named = std::iter::once(self.session.default_expression.as_str())
            .chain(PRIMARY_EXPRESSIONS)
            .find_map(|name| config.bound(name).and_then(|files| files.first()));
        if let Some(file) = named {
            return Some(file.clone());
        }

        config
            .iter()
            .find(|(name, files)| !files.is_empty() && !is_reserved(name) && !name.starts_with("表情"))
            .and_then(|(_, files)| files.first().cloned())
    }

    /// Sends the file's asset id to the renderer.
    pub fn play_expression_file(&self, file: &str) -> bool {
        let asset_id = asset_id_from_file(file);
        match self.renderer.select_expression(asset_id) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to play expression {}: {:#}", asset_id, e);
                false
            }
        }
    }

    pub fn play_motion(&self, index: usize) {
        let group = &self.motion_group;
        let count = match self.renderer.motion_count(group) {
            Some(count) if count > 0 => count,
            _ => {
                error!("Motion group '{}' is empty or missing", group);
                return;
            }
        };
        if let Err(e) = self.renderer.select_motion(group, index % count) {
            error!("Failed to play motion {}[{}]: {:#}", group, index % count, e);
        }
    }

    /// Binds the files of `expression_name` to `emotion`. Binding a file that
    /// is already bound adds nothing. Returns false if the expression cannot
    /// be found.
    pub fn bind(&mut self, emotion: &str, expression_name: &str) -> bool {
        let mut discovered = false;
        if !self.config().contains(expression_name) {
            let Some(file) = self.find_expression_file(expression_name) else {
                warn!("No expression file found for '{}'", expression_name);
                return false;
            };
            info!("Adding expression {} -> {}", expression_name, file);
            self.session
                .expression_config
                .insert(expression_name, vec![file]);
            discovered = true;
        }

        let files = match self.config().bound(expression_name) {
            Some(files) => files.to_vec(),
            None => {
                warn!("Expression '{}' has no files", expression_name);
                return false;
            }
        };

        let bound = self.session.expression_config.get_or_insert(emotion);
        let mut added = false;
        for file in &files {
            if !bound.contains(file) {
                bound.push(file.clone());
                added = true;
            }
        }

        if added {
            info!("Bound {} to emotion {}", expression_name, emotion);
            self.events.emit(PresenterEvent::ExpressionBound {
                emotion: emotion.to_string(),
                expression: expression_name.to_string(),
                files,
            });
        } else {
            debug!("{} already bound to {}", expression_name, emotion);
        }
        if added || discovered {
            self.persist();
        }
        true
    }

    /// Removes the file `expression_name` names from `emotion`. The name may
    /// be the file path, its asset id (`expression3`) or its display name
    /// (`表情3`). Returns false when nothing matched.
    pub fn unbind(&mut self, emotion: &str, expression_name: &str) -> bool {
        if expression_name.is_empty() {
            warn!("Refusing to unbind an empty expression name from '{}'", emotion);
            return false;
        }
        let Some(files) = self.session.expression_config.get_mut(emotion) else {
            warn!("Emotion '{}' has no bindings", emotion);
            return false;
        };
        let Some(idx) = files.iter().position(|f| {
            f == expression_name
                || asset_id_from_file(f) == expression_name
                || display_name_from_file(f) == expression_name
        }) else {
            warn!("Emotion '{}' has no expression '{}'", emotion, expression_name);
            return false;
        };

        files.remove(idx);
        info!("Unbound {} from emotion {}", expression_name, emotion);
        self.persist();
        self.events.emit(PresenterEvent::ExpressionUnbound {
            emotion: emotion.to_string(),
            expression: expression_name.to_string(),
        });
        true
    }

    pub fn emotion_bindings(&self, emotion: &str) -> Vec<ExpressionBinding> {
        self.config()
            .get(emotion)
            .unwrap_or_default()
            .iter()
            .map(|file| ExpressionBinding {
                file: file.clone(),
                name: display_name_from_file(file),
            })
            .collect()
    }

    /// Bindings of every emotion category, in category order.
    pub fn all_emotion_bindings(&self) -> Vec<(String, Vec<ExpressionBinding>)> {
        EMOTION_CATEGORIES
            .iter()
            .map(|emotion| (emotion.to_string(), self.emotion_bindings(emotion)))
            .collect()
    }

    /// Re-reads this character's record. Keeps the current bindings if the
    /// store fails or has no record.
    pub async fn reload(&mut self, store: &dyn ExpressionStore) -> bool {
        match store.load(&self.session.character_id).await {
            Ok(Some(config)) => {
                self.session.expression_config = config;
                true
            }
            Ok(None) => {
                warn!("No stored config for '{}'", self.session.character_id);
                false
            }
            Err(e) => {
                error!("Reloading expression config failed: {:#}", e);
                self.events.fault(SyncError::ConfigUnavailable {
                    character: self.session.character_id.clone(),
                    reason: format!("{:#}", e),
                });
                false
            }
        }
    }

    fn persist(&self) {
        match &self.persister {
            Some(persister) => persister.request(&self.session.character_id, self.config()),
            None => debug!("No persister attached, binding kept in memory"),
        }
    }
}
