use anyhow::Result;
use std::path::PathBuf;
use tickclock::prelude::*;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration from an optional TOML file and the environment.
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = TickclockConfig::load(config_path.as_deref())?;

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter()?)
        .with_target(false)
        .init();

    // 3. Create the engine instance.
    let tempo = config.tempo_bpm;
    let engine = MetronomeEngine::spawn(config)?;

    // 4. Spawn concurrent tasks to listen to the event streams.
    spawn_event_listeners(&engine);

    // 5. Start beating and run until Ctrl+C.
    engine.start(tempo).await?;
    engine.run_until_ctrl_c().await?;

    Ok(())
}

/// Spawns one task per event stream that logs everything it receives.
fn spawn_event_listeners(engine: &MetronomeEngine) {
    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            match event {
                SystemEvent::SinkFailed { .. } | SystemEvent::TimerFailed { .. } => {
                    warn!("[SYSTEM] => {:?}", event)
                }
                _ => info!("[SYSTEM] => {:?}", event),
            }
        }
    });

    let mut beat_rx = engine.subscribe_beats();
    tokio::spawn(async move {
        while let Ok(beat) = beat_rx.recv().await {
            info!(
                "[BEAT] #{} at {} ({:.3} ms late)",
                beat.index,
                beat.tempo,
                beat.drift.as_secs_f64() * 1000.0
            );
        }
    });
}
