mod connection;
mod radio;
mod readings;

use anyhow::Result;
use connection::{event_channel, ConnectionManager};
use radio::BluerRadio;
use readings::{ReadingPipeline, Recorder, RecorderConfig};
use sensorlink_shared::state_machine::ConnectionState;
use sensorlink_shared::LinkConfig;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = LinkConfig::default();

    info!("Sensor link starting: {}", config.target.name);
    info!("  service: {}", config.target.service);
    info!("  notify:  {}", config.target.notify);

    let (events_tx, events_rx) = event_channel();
    let radio = BluerRadio::new(events_tx.clone()).await?;
    let manager = ConnectionManager::new(config, Arc::new(radio), events_tx, events_rx);

    let pipeline = ReadingPipeline::new()?;
    let recorder_config = RecorderConfig::default();
    info!("Recordings go to {}", recorder_config.output_dir.display());
    let mut recorder = Recorder::new(recorder_config, pipeline.subscribe());
    tokio::spawn(pipeline.run(manager.subscribe_state(), manager.subscribe_payload()));

    // Spawn payload printer
    let mut payload_rx = manager.subscribe_payload();
    tokio::spawn(async move {
        while payload_rx.changed().await.is_ok() {
            let payload = payload_rx.borrow_and_update().clone();
            info!("[DATA] {}", payload);
        }
    });

    // Spawn failure hint
    let mut state_rx = manager.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            if let ConnectionState::Failed(reason) = &*state_rx.borrow_and_update() {
                warn!("Link failed ({}), enter 'r' to retry", reason);
            }
        }
    });

    info!("Commands: r = retry, s = status, rec = start/stop recording, q = quit");

    // Main command loop
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "r" | "retry" => {
                        if let Err(e) = manager.retry().await {
                            error!("Retry failed: {}", e);
                            break;
                        }
                    }
                    "s" | "status" => {
                        info!(
                            "State: {} | payload: {:?} | retries: {}",
                            manager.state(),
                            manager.latest_payload(),
                            manager.retry_count()
                        );
                    }
                    "rec" => toggle_recording(&mut recorder).await,
                    "q" | "quit" => break,
                    "" => {}
                    other => warn!("Unknown command: {}", other),
                },
                Ok(None) => {
                    info!("stdin closed, press Ctrl-C to quit");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Err(e) = recorder.stop().await {
        error!("[REC] Failed to save recording: {}", e);
    }
    manager.shutdown().await;
    info!("Sensor link stopped");
    Ok(())
}

async fn toggle_recording(recorder: &mut Recorder) {
    if recorder.is_recording() {
        if let Err(e) = recorder.stop().await {
            error!("[REC] Failed to save recording: {}", e);
        }
    } else if let Err(e) = recorder.start() {
        error!("[REC] Failed to start recording: {}", e);
    }
}
