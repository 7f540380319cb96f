//! Radio capability abstraction for pluggable BLE backends

use anyhow::Result;
use async_trait::async_trait;
use sensorlink_shared::state_machine::{Epoch, PeripheralId, PowerState};
use uuid::Uuid;

/// Fire-and-forget BLE operations
///
/// Requests return as soon as they are issued. Outcomes, discoveries,
/// value updates, disconnects and power changes are reported later on the
/// event sender the adapter was built with, tagged with the request epoch.
/// An `Err` means the request could not be issued at all.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current power state of the radio
    async fn power_state(&self) -> PowerState;

    /// Start reporting nearby peripherals
    async fn start_scan(&self, epoch: Epoch) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()>;

    /// Tear down any connection or pending connect to the peripheral
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_services(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()>;

    /// Discover characteristics of one service, keeping only `filter` UUIDs
    /// (all of them when `filter` is empty)
    async fn discover_characteristics(
        &self,
        epoch: Epoch,
        peripheral: &PeripheralId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<()>;

    async fn set_notify(
        &self,
        epoch: Epoch,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}
