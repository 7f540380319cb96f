//! Periodic sampling of smoothed readings into CSV files

use super::pipeline::FilteredValues;
use anyhow::{anyhow, Result};
use chrono::{Local, Utc};
use sensorlink_shared::codec::{self, PressureSample};
use std::path::PathBuf;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::info;

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory CSV files are written to
    pub output_dir: PathBuf,
    /// Time between samples
    pub sample_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            sample_interval: Duration::from_millis(100),
        }
    }
}

struct Session {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Vec<PressureSample>>,
}

/// Samples the latest filtered values while recording
pub struct Recorder {
    config: RecorderConfig,
    values: watch::Receiver<FilteredValues>,
    session: Option<Session>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, values: watch::Receiver<FilteredValues>) -> Self {
        Self {
            config,
            values,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Start sampling into a fresh recording
    pub fn start(&mut self) -> Result<()> {
        if self.is_recording() {
            return Err(anyhow!("Recording already in progress"));
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let values = self.values.clone();
        let period = self.config.sample_interval;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval_at(started + period, period);
            let mut samples = Vec::new();

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let current = *values.borrow();
                        samples.push(PressureSample {
                            elapsed_secs: started.elapsed().as_secs_f64(),
                            utc_timestamp: Utc::now().timestamp(),
                            pressure: current.pressure,
                            temperature: current.temperature,
                        });
                    }
                }
            }
            samples
        });

        info!("[REC] Recording started");
        self.session = Some(Session { stop_tx, task });
        Ok(())
    }

    /// Stop recording and write the CSV file, returning its path
    ///
    /// Returns `Ok(None)` when nothing was being recorded.
    pub async fn stop(&mut self) -> Result<Option<PathBuf>> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        let _ = session.stop_tx.send(());
        let samples = session
            .task
            .await
            .map_err(|e| anyhow!("Recording task failed: {}", e))?;

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let file_name = Local::now()
            .format("PressureLog_%Y%m%d_%H%M%S.csv")
            .to_string();
        let path = self.config.output_dir.join(file_name);
        tokio::fs::write(&path, codec::encode_csv(&samples)).await?;

        info!("[REC] Saved {} samples to {}", samples.len(), path.display());
        Ok(Some(path))
    }
}
