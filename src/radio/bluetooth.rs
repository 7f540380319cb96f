//! BlueZ radio adapter built on bluer

use crate::connection::EventSender;
use crate::radio::traits::RadioAdapter;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sensorlink_shared::state_machine::{
    DiscoveredPeripheral, Epoch, LinkEvent, PeripheralId, PowerState, RadioEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often to check whether BlueZ has finished resolving services
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

/// Disconnect detail when BlueZ drops the device object altogether
const DEVICE_REMOVED: &str = "device removed";

/// Background tasks, one slot per kind of outstanding request
#[derive(Default)]
struct RadioTasks {
    scan: Option<JoinHandle<()>>,
    link: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
    notify: Option<JoinHandle<()>>,
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

fn abort_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

/// Stop work that needs a live connection
fn end_session(tasks: &mut RadioTasks) {
    abort_task(&mut tasks.discovery);
    abort_task(&mut tasks.notify);
}

/// Radio adapter backed by the default BlueZ adapter
pub struct BluerRadio {
    adapter: Adapter,
    events: EventSender,
    tasks: Arc<Mutex<RadioTasks>>,
    power_monitor: JoinHandle<()>,
}

impl BluerRadio {
    /// Open the default adapter and start reporting power changes
    pub async fn new(events: EventSender) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("[BT] Using adapter {}", adapter.name());

        let power_monitor = spawn_power_monitor(&adapter, events.clone()).await?;

        Ok(Self {
            adapter,
            events,
            tasks: Arc::new(Mutex::new(RadioTasks::default())),
            power_monitor,
        })
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device> {
        let address: Address = peripheral
            .0
            .parse()
            .map_err(|e| anyhow!("Invalid peripheral address {}: {}", peripheral, e))?;
        Ok(self.adapter.device(address)?)
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.power_monitor.abort();
    }
}

async fn spawn_power_monitor(adapter: &Adapter, events: EventSender) -> Result<JoinHandle<()>> {
    let stream = adapter.events().await?;

    Ok(tokio::spawn(async move {
        tokio::pin!(stream);
        while let Some(evt) = stream.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = evt {
                info!("[BT] Adapter powered: {}", powered);
                let state = if powered { PowerState::On } else { PowerState::Off };
                if events.send(LinkEvent::PowerChanged(state)).await.is_err() {
                    break;
                }
            }
        }
    }))
}

async fn send_radio(events: &EventSender, epoch: Epoch, event: RadioEvent) -> bool {
    events.send(LinkEvent::Radio { epoch, event }).await.is_ok()
}

/// Wait for the link to drop, returning the disconnect detail if any
///
/// BlueZ only flips `Connected` to false without a reason. The stream
/// ending means the device object itself went away.
async fn wait_for_disconnect(events: impl Stream<Item = DeviceEvent>) -> Option<String> {
    tokio::pin!(events);

    while let Some(evt) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = evt {
            return None;
        }
    }
    Some(DEVICE_REMOVED.into())
}

/// Report an unsolicited disconnect once BlueZ drops the link
async fn watch_link(
    device: Device,
    peripheral: PeripheralId,
    epoch: Epoch,
    events: EventSender,
    tasks: Arc<Mutex<RadioTasks>>,
) {
    let stream = match device.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[BT] Cannot watch {} for disconnects: {}", peripheral, e);
            return;
        }
    };

    let error = wait_for_disconnect(stream).await;
    info!("[BT] {} disconnected ({})", peripheral, error.as_deref().unwrap_or("link lost"));
    end_session(&mut *tasks.lock().await);

    send_radio(&events, epoch, RadioEvent::Disconnected { peripheral, error }).await;
}

async fn find_service(device: &Device, uuid: Uuid) -> Result<Service> {
    for service in device.services().await? {
        if service.uuid().await? == uuid {
            return Ok(service);
        }
    }
    Err(anyhow!("Service {} not found", uuid))
}

async fn find_characteristic(service: &Service, uuid: Uuid) -> Result<Characteristic> {
    for characteristic in service.characteristics().await? {
        if characteristic.uuid().await? == uuid {
            return Ok(characteristic);
        }
    }
    Err(anyhow!("Characteristic {} not found", uuid))
}

async fn resolve_services(device: &Device) -> Result<Vec<Uuid>> {
    while !device.is_services_resolved().await? {
        if !device.is_connected().await? {
            return Err(anyhow!("Device disconnected before services resolved"));
        }
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }

    let mut uuids = Vec::new();
    for service in device.services().await? {
        uuids.push(service.uuid().await?);
    }
    Ok(uuids)
}

async fn list_characteristics(device: &Device, service: Uuid, filter: &[Uuid]) -> Result<Vec<Uuid>> {
    let service = find_service(device, service).await?;

    let mut uuids = Vec::new();
    for characteristic in service.characteristics().await? {
        let uuid = characteristic.uuid().await?;
        if filter.is_empty() || filter.contains(&uuid) {
            uuids.push(uuid);
        }
    }
    Ok(uuids)
}

#[async_trait]
impl RadioAdapter for BluerRadio {
    async fn power_state(&self) -> PowerState {
        match self.adapter.is_powered().await {
            Ok(true) => PowerState::On,
            Ok(false) => PowerState::Off,
            Err(e) => {
                warn!("[BT] Cannot read adapter power state: {}", e);
                PowerState::Off
            }
        }
    }

    async fn start_scan(&self, epoch: Epoch) -> Result<()> {
        // Property changes re-report a device, so a name that resolves late still matches
        let discover = self.adapter.discover_devices_with_changes().await?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        info!("[BT] Scanning on {}", adapter.name());

        let task = tokio::spawn(async move {
            tokio::pin!(discover);
            while let Some(evt) = discover.next().await {
                let AdapterEvent::DeviceAdded(addr) = evt else {
                    continue;
                };
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };

                let found = DiscoveredPeripheral {
                    id: PeripheralId(addr.to_string()),
                    name: device.name().await.ok().flatten(),
                    rssi: device.rssi().await.ok().flatten(),
                };
                debug!("[BT] Discovered {} {:?} rssi={:?}", found.id, found.name, found.rssi);

                if !send_radio(&events, epoch, RadioEvent::PeripheralDiscovered(found)).await {
                    break;
                }
            }
        });

        replace_task(&mut self.tasks.lock().await.scan, task);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        // Dropping the discovery stream ends the BlueZ discovery session
        abort_task(&mut self.tasks.lock().await.scan);
        Ok(())
    }

    async fn connect(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let events = self.events.clone();
        let tasks = self.tasks.clone();
        info!("[BT] Connecting to {}", peripheral);

        let task = tokio::spawn(async move {
            match device.connect().await {
                Ok(()) => {
                    info!("[BT] Connected to {}", peripheral);
                    let connected = RadioEvent::Connected {
                        peripheral: peripheral.clone(),
                    };
                    if send_radio(&events, epoch, connected).await {
                        watch_link(device, peripheral, epoch, events, tasks).await;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("[BT] Connect to {} failed: {}", peripheral, reason);
                    send_radio(&events, epoch, RadioEvent::ConnectFailed { peripheral, reason })
                        .await;
                }
            }
        });

        replace_task(&mut self.tasks.lock().await.link, task);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            abort_task(&mut tasks.link);
            end_session(&mut tasks);
        }

        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            match device.disconnect().await {
                Ok(()) => info!("[BT] Disconnected from {}", peripheral),
                Err(e) => debug!("[BT] Disconnect from {}: {}", peripheral, e),
            }
        });
        Ok(())
    }

    async fn discover_services(&self, epoch: Epoch, peripheral: &PeripheralId) -> Result<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let event = match resolve_services(&device).await {
                Ok(services) => {
                    debug!("[BT] {} services: {:?}", peripheral, services);
                    RadioEvent::ServicesDiscovered {
                        peripheral,
                        services,
                    }
                }
                Err(e) => RadioEvent::DiscoveryFailed {
                    peripheral,
                    reason: e.to_string(),
                },
            };
            send_radio(&events, epoch, event).await;
        });

        replace_task(&mut self.tasks.lock().await.discovery, task);
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        epoch: Epoch,
        peripheral: &PeripheralId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let filter = filter.to_vec();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let event = match list_characteristics(&device, service, &filter).await {
                Ok(characteristics) => RadioEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics,
                },
                Err(e) => RadioEvent::DiscoveryFailed {
                    peripheral,
                    reason: e.to_string(),
                },
            };
            send_radio(&events, epoch, event).await;
        });

        replace_task(&mut self.tasks.lock().await.discovery, task);
        Ok(())
    }

    async fn set_notify(
        &self,
        epoch: Epoch,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        if !enabled {
            abort_task(&mut self.tasks.lock().await.notify);
            return Ok(());
        }

        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let notifications = async {
                let service = find_service(&device, service).await?;
                let target = find_characteristic(&service, characteristic).await?;
                Ok::<_, anyhow::Error>(target.notify().await?)
            };
            let stream = match notifications.await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[BT] Cannot enable notifications on {}: {}", peripheral, e);
                    return;
                }
            };
            info!("[BT] Notifications enabled on {}", characteristic);
            tokio::pin!(stream);

            while let Some(value) = stream.next().await {
                let event = RadioEvent::ValueUpdated {
                    characteristic,
                    value: Bytes::from(value),
                };
                if !send_radio(&events, epoch, event).await {
                    break;
                }
            }
            debug!("[BT] Notification stream from {} ended", peripheral);
        });

        replace_task(&mut self.tasks.lock().await.notify, task);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BlueZ"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_connected_false_is_clean_disconnect() {
        let events = stream::iter(vec![
            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-60)),
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)),
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)),
            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-61)),
        ]);
        assert_eq!(wait_for_disconnect(events).await, None);
    }

    #[tokio::test]
    async fn test_removed_device_reports_error() {
        let events = stream::iter(vec![DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-60))]);
        assert_eq!(
            wait_for_disconnect(events).await,
            Some("device removed".to_string())
        );
    }

    fn parked(alive: oneshot::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn test_end_session_stops_connection_work() {
        let (discovery_tx, discovery_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = oneshot::channel();
        let (scan_tx, mut scan_rx) = oneshot::channel::<()>();

        let mut tasks = RadioTasks {
            scan: Some(parked(scan_tx)),
            link: None,
            discovery: Some(parked(discovery_tx)),
            notify: Some(parked(notify_tx)),
        };
        end_session(&mut tasks);

        assert!(tasks.discovery.is_none());
        assert!(tasks.notify.is_none());
        // Aborted tasks drop their senders
        assert!(discovery_rx.await.is_err());
        assert!(notify_rx.await.is_err());

        // Scanning is not tied to the connection
        assert!(tasks.scan.is_some());
        assert!(matches!(
            scan_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        abort_task(&mut tasks.scan);
    }
}
