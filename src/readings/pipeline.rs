//! Turns raw payloads into smoothed readings

use super::filter::{EmaFilter, PRESSURE_ALPHA, TEMPERATURE_ALPHA};
use anyhow::Result;
use sensorlink_shared::codec;
use sensorlink_shared::state_machine::ConnectionState;
use tokio::sync::watch;
use tracing::{debug, info};

/// Latest smoothed values; zero until the first reading arrives
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilteredValues {
    pub pressure: f64,
    pub temperature: f64,
}

/// Parses payloads, smooths each field and publishes the result
pub struct ReadingPipeline {
    pressure: EmaFilter,
    temperature: EmaFilter,
    values_tx: watch::Sender<FilteredValues>,
}

impl ReadingPipeline {
    pub fn new() -> Result<Self> {
        let (values_tx, _) = watch::channel(FilteredValues::default());
        Ok(Self {
            pressure: EmaFilter::new(PRESSURE_ALPHA)?,
            temperature: EmaFilter::new(TEMPERATURE_ALPHA)?,
            values_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<FilteredValues> {
        self.values_tx.subscribe()
    }

    /// Smooth whichever fields the payload carries
    pub fn on_payload(&mut self, payload: &str) {
        let reading = match codec::parse_reading(payload) {
            Ok(reading) => reading,
            Err(e) => {
                debug!("[READ] Skipping payload: {}", e);
                return;
            }
        };

        let pressure = reading.pressure.map(|p| self.pressure.filter(p));
        let temperature = reading.temperature.map(|t| self.temperature.filter(t));

        self.values_tx.send_modify(|values| {
            if let Some(p) = pressure {
                values.pressure = p;
            }
            if let Some(t) = temperature {
                values.temperature = t;
            }
        });
    }

    /// Restart smoothing on every fresh subscription
    pub fn on_state(&mut self, state: &ConnectionState) {
        if *state == ConnectionState::Subscribed {
            info!("[READ] Link subscribed, resetting filters");
            self.pressure.reset();
            self.temperature.reset();
        }
    }

    /// Follow the link until its manager goes away
    pub async fn run(
        mut self,
        mut state_rx: watch::Receiver<ConnectionState>,
        mut payload_rx: watch::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = state_rx.borrow_and_update().clone();
                    self.on_state(&state);
                }
                changed = payload_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let payload = payload_rx.borrow_and_update().clone();
                    self.on_payload(&payload);
                }
            }
        }
    }
}
