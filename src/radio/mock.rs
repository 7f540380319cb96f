//! In-memory radio for driving the connection manager in tests

use crate::radio::traits::RadioAdapter;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sensorlink_shared::state_machine::{Epoch, PeripheralId, PowerState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A request the manager issued to the radio
#[derive(Debug, Clone, PartialEq)]
pub enum RadioCall {
    StartScan(Epoch),
    StopScan,
    Connect(Epoch, PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(Epoch, PeripheralId),
    DiscoverCharacteristics(Epoch, PeripheralId, Uuid),
    SetNotify(Epoch, Uuid, bool),
}

/// Records every request; outcomes are injected by the test
#[derive(Clone)]
pub struct MockRadio {
    calls: Arc<Mutex<Vec<RadioCall>>>,
    powered: Arc<AtomicBool>,
    reject_connect: Arc<AtomicBool>,
}

impl MockRadio {
    pub fn new(powered: bool) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            powered: Arc::new(AtomicBool::new(powered)),
            reject_connect: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    /// Make `connect` fail to issue
    pub fn reject_connect(&self, reject: bool) {
        self.reject_connect.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Epoch of the most recent scan request
    pub fn last_scan_epoch(&self) -> Option<Epoch> {
        self.calls().iter().rev().find_map(|call| match call {
            RadioCall::StartScan(epoch) => Some(*epoch),
            _ => None,
        })
    }

    pub fn scan_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RadioCall::StartScan(_)))
            .count()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    async fn power_state(&self) -> PowerState {
        if self.powered.load(Ordering::SeqCst) {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    async fn start_scan(&self, epoch: Epoch) -> Result<()> {
        self.record(RadioCall::StartScan(epoch));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()> {
        self.record(RadioCall::Connect(epoch, peripheral.clone()));
        if self.reject_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("connect rejected"));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(RadioCall::Disconnect(peripheral.clone()));
        Ok(())
    }

    async fn discover_services(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()> {
        self.record(RadioCall::DiscoverServices(epoch, peripheral.clone()));
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        epoch: Epoch,
        peripheral: &PeripheralId,
        service: Uuid,
        _filter: &[Uuid],
    ) -> Result<()> {
        self.record(RadioCall::DiscoverCharacteristics(
            epoch,
            peripheral.clone(),
            service,
        ));
        Ok(())
    }

    async fn set_notify(
        &self,
        epoch: Epoch,
        _peripheral: &PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        self.record(RadioCall::SetNotify(epoch, characteristic, enabled));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
