use crate::core::error::SyncError;
use crate::core::events::EventBus;
use crate::core::io::Storage;
use crate::core::state::{CharacterSession, ExpressionConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const EXPRESSIONS_KEY: &str = "emotion_expressions";

/// Per-character persistence of emotion -> expression bindings.
#[async_trait]
pub trait ExpressionStore: Send + Sync {
    /// `Ok(None)` when the character has no record yet.
    async fn load(&self, character_id: &str) -> Result<Option<ExpressionConfig>>;
    async fn save(&self, character_id: &str, config: &ExpressionConfig) -> Result<()>;
}

/// All characters in one JSON document:
/// `{characterId: {emotion_expressions: {emotion: [file, ...]}}}`.
///
/// Saving rewrites only the target character's bindings; other records and
/// unknown fields are kept as they are.
pub struct JsonFileStore {
    storage: Arc<dyn Storage>,
    path: String,
}

impl JsonFileStore {
    pub fn new(storage: Arc<dyn Storage>, path: &str) -> Self {
        Self {
            storage,
            path: path.to_string(),
        }
    }

    async fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.storage.exists(&self.path).await? {
            return Ok(Map::new());
        }
        let bytes = self.storage.read(&self.path).await?;
        let doc: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", self.path))?;
        match doc {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("{} is not a JSON object", self.path)),
        }
    }
}

#[async_trait]
impl ExpressionStore for JsonFileStore {
    async fn load(&self, character_id: &str) -> Result<Option<ExpressionConfig>> {
        let doc = self.read_document().await?;
        let Some(expressions) = doc.get(character_id).and_then(|r| r.get(EXPRESSIONS_KEY)) else {
            return Ok(None);
        };
        let config = serde_json::from_value(expressions.clone())
            .with_context(|| format!("Bad {} for '{}'", EXPRESSIONS_KEY, character_id))?;
        Ok(Some(config))
    }

    async fn save(&self, character_id: &str, config: &ExpressionConfig) -> Result<()> {
        let mut doc = self.read_document().await?;

        let record = doc
            .entry(character_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !record.is_object() {
            *record = Value::Object(Map::new());
        }
        if let Value::Object(fields) = record {
            fields.insert(EXPRESSIONS_KEY.to_string(), serde_json::to_value(config)?);
        }

        let content = serde_json::to_string_pretty(&Value::Object(doc))?;
        self.storage.write(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}

/// Loads the character's bindings, never failing.
///
/// A missing record yields the built-in categories, which are saved as the
/// character's new record (to `fallback` if `store` refuses the write). A
/// load error yields the same defaults unsaved.
pub async fn load_session(
    store: &dyn ExpressionStore,
    fallback: Option<&dyn ExpressionStore>,
    character_id: &str,
    default_expression: &str,
    events: &EventBus,
) -> CharacterSession {
    let config = match store.load(character_id).await {
        Ok(Some(config)) => {
            info!(
                "Loaded expression config for '{}', emotions: {:?}",
                character_id,
                config.keys().collect::<Vec<_>>()
            );
            config
        }
        Ok(None) => {
            warn!("No expression config for '{}', creating defaults", character_id);
            let config = ExpressionConfig::with_default_categories();
            save_with_fallback(store, fallback, character_id, &config, events).await;
            config
        }
        Err(e) => {
            error!("Expression config load failed: {:#}", e);
            events.fault(SyncError::ConfigUnavailable {
                character: character_id.to_string(),
                reason: format!("{:#}", e),
            });
            ExpressionConfig::with_default_categories()
        }
    };

    CharacterSession::new(character_id, config, default_expression)
}

/// Saves to `primary`, falling back to `fallback` on failure. Never errors.
pub async fn save_with_fallback(
    primary: &dyn ExpressionStore,
    fallback: Option<&dyn ExpressionStore>,
    character_id: &str,
    config: &ExpressionConfig,
    events: &EventBus,
) {
    let Err(e) = primary.save(character_id, config).await else {
        info!("Saved expression config for '{}'", character_id);
        return;
    };

    warn!("Saving expression config failed, trying local cache: {:#}", e);
    events.fault(SyncError::ConfigUnavailable {
        character: character_id.to_string(),
        reason: format!("{:#}", e),
    });

    if let Some(cache) = fallback {
        match cache.save(character_id, config).await {
            Ok(()) => info!("Expression config for '{}' saved to local cache", character_id),
            Err(e) => error!("Local cache save failed too: {:#}", e),
        }
    }
}

type Snapshot = Option<(String, ExpressionConfig)>;

/// Background saver. Requests made while a save is in flight collapse into
/// the latest snapshot, so at most one save runs at a time.
pub struct PersistHandle {
    tx: watch::Sender<Snapshot>,
    task: JoinHandle<()>,
}

impl PersistHandle {
    pub fn spawn(
        primary: Arc<dyn ExpressionStore>,
        fallback: Option<Arc<dyn ExpressionStore>>,
        events: EventBus,
    ) -> Self {
        let (tx, mut rx) = watch::channel::<Snapshot>(None);

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some((character_id, config)) = snapshot {
                    save_with_fallback(
                        primary.as_ref(),
                        fallback.as_deref(),
                        &character_id,
                        &config,
                        &events,
                    )
                    .await;
                }
            }
        });

        Self { tx, task }
    }

    pub fn request(&self, character_id: &str, config: &ExpressionConfig) {
        self.tx
            .send_replace(Some((character_id.to_string(), config.clone())));
    }

    /// Waits for the last requested snapshot to be written, then stops.
    pub async fn flush(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!("Persister task failed: {}", e);
        }
    }
}
