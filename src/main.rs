use anyhow::Result;
use live2d_sync::core::config::Config;
use live2d_sync::core::events::{EventBus, PresenterEvent};
use live2d_sync::core::io::{NativeStorage, Storage};
use live2d_sync::core::state::character_id_from_model_path;
use live2d_sync::services::audio::WavClip;
use live2d_sync::services::expression::ExpressionMapper;
use live2d_sync::services::presenter::Presenter;
use live2d_sync::services::render::LogRenderer;
use live2d_sync::services::store::{load_session, ExpressionStore, JsonFileStore, PersistHandle};
use live2d_sync::utils::clock::TokioClock;
use log::{error, info, warn};
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    // 2. Stores
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let primary: Arc<dyn ExpressionStore> = Arc::new(JsonFileStore::new(storage.clone(), &config.store.path));
    let cache: Arc<dyn ExpressionStore> = Arc::new(JsonFileStore::new(storage.clone(), &config.store.cache_path));

    // 3. Character session
    let character_id = character_id_from_model_path(&config.character.model_path, &config.character.model_root)
        .unwrap_or_else(|| {
            warn!(
                "Cannot derive character from '{}', using '{}'",
                config.character.model_path, config.character.fallback_id
            );
            config.character.fallback_id.clone()
        });
    info!("Character: {}", character_id);

    let events = EventBus::new();
    let logger = spawn_event_logger(&events);

    let session = load_session(
        primary.as_ref(),
        Some(cache.as_ref()),
        &character_id,
        &config.character.default_expression,
        &events,
    )
    .await;

    // 4. Mapper and presenter
    let renderer = Rc::new(
        LogRenderer::new().with_motion_group(&config.character.motion_group, config.character.motion_count),
    );
    let persister = PersistHandle::spawn(primary.clone(), Some(cache), events.clone());
    let mapper = ExpressionMapper::new(session, renderer.clone(), events)
        .with_persister(persister)
        .with_motion_group(&config.character.motion_group)
        .into_shared();

    if let Some(index) = config.character.idle_motion {
        mapper.borrow().play_motion(index);
    }
    mapper.borrow().play_default_expression();

    let mut presenter = Presenter::new(mapper.clone(), renderer, Rc::new(TokioClock::new()), &config);

    // 5. Play segments
    for (i, segment) in config.segments.iter().enumerate() {
        info!("Segment {}/{}: {}", i + 1, config.segments.len(), segment.text);
        let bytes = match storage.read(&segment.audio).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Skipping segment {}: {:#}", i + 1, e);
                continue;
            }
        };
        let mut clip = WavClip::new(bytes, Rc::new(TokioClock::new()));
        let outcome = presenter.play_audio(&mut clip, &segment.text).await;
        info!("Segment {} -> {:?}", i + 1, outcome);
    }

    // 6. Flush pending saves
    let persister = mapper.borrow_mut().take_persister();
    if let Some(persister) = persister {
        persister.flush().await;
    }

    // Last senders go with the presenter and mapper; the logger drains and exits.
    drop(presenter);
    drop(mapper);
    if let Err(e) = logger.await {
        error!("Event logger failed: {}", e);
    }

    Ok(())
}

fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PresenterEvent::Subtitle(text)) => println!("{}", text),
                Ok(PresenterEvent::Fault(e)) => warn!("{}", e),
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(n)) => warn!("Event logger lagged, {} events lost", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
