//! Connection manager driving the link state machine against a radio

use super::deadline::Deadline;
use crate::radio::RadioAdapter;
use anyhow::{anyhow, Result};
use sensorlink_shared::state_machine::{
    ConnectionState, LinkAction, LinkEvent, LinkStateMachine, RadioEvent,
};
use sensorlink_shared::LinkConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sender half handed to radio adapters and timers
pub type EventSender = mpsc::Sender<LinkEvent>;

/// Receiver half consumed by the manager loop
pub type EventReceiver = mpsc::Receiver<LinkEvent>;

/// Create the channel that carries radio, power and timer events
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(100)
}

/// Commands a consumer may issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerCommand {
    Retry,
}

/// Owns the connection to the sensor and publishes its state
pub struct ConnectionManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    payload_rx: watch::Receiver<String>,
    retry_rx: watch::Receiver<u32>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the link loop
    ///
    /// `events` must be the sender the radio adapter reports on, and
    /// `event_rx` its receiving half.
    pub fn new(
        config: LinkConfig,
        radio: Arc<dyn RadioAdapter>,
        events: EventSender,
        event_rx: EventReceiver,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (payload_tx, payload_rx) = watch::channel(String::new());
        let (retry_tx, retry_rx) = watch::channel(0);

        info!(
            "[LINK] Looking for {:?} via {}",
            config.target.name,
            radio.name()
        );

        let actor = ManagerActor {
            fsm: LinkStateMachine::new(config),
            radio,
            step_timer: Deadline::new(events.clone()),
            retry_timer: Deadline::new(events),
            event_rx,
            command_rx,
            state_tx,
            payload_tx,
            retry_tx,
        };
        let task = tokio::spawn(actor.run());

        Self {
            command_tx,
            state_rx,
            payload_rx,
            retry_rx,
            task,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Text of the most recent value update
    pub fn latest_payload(&self) -> String {
        self.payload_rx.borrow().clone()
    }

    pub fn subscribe_payload(&self) -> watch::Receiver<String> {
        self.payload_rx.clone()
    }

    /// Auto-retries spent since the link was last subscribed
    pub fn retry_count(&self) -> u32 {
        *self.retry_rx.borrow()
    }

    /// Abandon the current attempt and start over
    pub async fn retry(&self) -> Result<()> {
        self.command_tx
            .send(ManagerCommand::Retry)
            .await
            .map_err(|_| anyhow!("Connection manager stopped"))
    }

    /// Stop the link loop, tearing down any connection
    pub async fn shutdown(self) {
        let Self {
            command_tx, task, ..
        } = self;
        drop(command_tx);
        if let Err(e) = task.await {
            error!("[LINK] Manager task failed: {}", e);
        }
    }
}

/// The task that owns the state machine
struct ManagerActor {
    fsm: LinkStateMachine,
    radio: Arc<dyn RadioAdapter>,
    step_timer: Deadline,
    retry_timer: Deadline,
    event_rx: EventReceiver,
    command_rx: mpsc::Receiver<ManagerCommand>,
    state_tx: watch::Sender<ConnectionState>,
    payload_tx: watch::Sender<String>,
    retry_tx: watch::Sender<u32>,
}

impl ManagerActor {
    async fn run(mut self) {
        let power = self.radio.power_state().await;
        self.handle_event(LinkEvent::PowerChanged(power)).await;

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
                command = self.command_rx.recv() => match command {
                    Some(ManagerCommand::Retry) => {
                        info!("[LINK] Retry requested");
                        self.handle_event(LinkEvent::RetryRequested).await;
                    }
                    None => break,
                },
            }
        }

        self.shutdown().await;
        info!("[LINK] Manager stopped");
    }

    /// Process an event and everything its actions feed back
    async fn handle_event(&mut self, event: LinkEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let from = self.fsm.state().clone();

            for action in self.fsm.process_event(event) {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }

            self.publish(from);
        }
    }

    async fn execute(&mut self, action: LinkAction) -> Option<LinkEvent> {
        match action {
            LinkAction::StartScan { epoch } => {
                if let Err(e) = self.radio.start_scan(epoch).await {
                    warn!("[LINK] Failed to start scan: {}", e);
                }
            }
            LinkAction::StopScan => {
                if let Err(e) = self.radio.stop_scan().await {
                    warn!("[LINK] Failed to stop scan: {}", e);
                }
            }
            LinkAction::Connect { epoch, peripheral } => {
                if let Err(e) = self.radio.connect(epoch, &peripheral).await {
                    return Some(LinkEvent::Radio {
                        epoch,
                        event: RadioEvent::ConnectFailed {
                            peripheral,
                            reason: e.to_string(),
                        },
                    });
                }
            }
            LinkAction::CancelConnection { peripheral } => {
                if let Err(e) = self.radio.disconnect(&peripheral).await {
                    warn!("[LINK] Failed to cancel connection to {}: {}", peripheral, e);
                }
            }
            LinkAction::DiscoverServices { epoch, peripheral } => {
                if let Err(e) = self.radio.discover_services(epoch, &peripheral).await {
                    warn!("[LINK] Service discovery not started: {}", e);
                }
            }
            LinkAction::DiscoverCharacteristics {
                epoch,
                peripheral,
                service,
                filter,
            } => {
                if let Err(e) = self
                    .radio
                    .discover_characteristics(epoch, &peripheral, service, &filter)
                    .await
                {
                    warn!("[LINK] Characteristic discovery not started: {}", e);
                }
            }
            LinkAction::SetNotify {
                epoch,
                peripheral,
                service,
                characteristic,
                enabled,
            } => {
                if let Err(e) = self
                    .radio
                    .set_notify(epoch, &peripheral, service, characteristic, enabled)
                    .await
                {
                    warn!("[LINK] Failed to set notify on {}: {}", characteristic, e);
                }
            }
            LinkAction::ArmTimeout { token, after } => {
                self.step_timer
                    .arm(after, LinkEvent::TimeoutElapsed { token });
            }
            LinkAction::CancelTimeout => self.step_timer.cancel(),
            LinkAction::ScheduleRetry { epoch, after } => {
                info!(
                    "[LINK] Reconnecting in {:?} (attempt {}/{})",
                    after,
                    self.fsm.retry_count(),
                    self.fsm.budget().max()
                );
                self.retry_timer.arm(after, LinkEvent::RetryDue { epoch });
            }
            LinkAction::CancelRetry => self.retry_timer.cancel(),
            LinkAction::PublishPayload(payload) => {
                debug!("[LINK] Payload: {}", payload);
                self.payload_tx.send_replace(payload);
            }
            LinkAction::EvaluatePower => {
                return Some(LinkEvent::PowerChanged(self.radio.power_state().await));
            }
        }
        None
    }

    fn publish(&mut self, from: ConnectionState) {
        let to = self.fsm.state();
        if *to != from {
            match to {
                ConnectionState::Failed(_) | ConnectionState::Disconnected(_) => {
                    warn!("[LINK] {:?} -> {:?}", from, to)
                }
                _ => info!("[LINK] {:?} -> {:?}", from, to),
            }
            self.state_tx.send_replace(to.clone());
        }

        let retries = self.fsm.retry_count();
        self.retry_tx.send_if_modified(|count| {
            let changed = *count != retries;
            *count = retries;
            changed
        });
    }

    async fn shutdown(&mut self) {
        self.step_timer.cancel();
        self.retry_timer.cancel();

        if *self.fsm.state() == ConnectionState::Scanning {
            if let Err(e) = self.radio.stop_scan().await {
                warn!("[LINK] Failed to stop scan: {}", e);
            }
        }
        if let Some(peripheral) = self.fsm.candidate() {
            if let Err(e) = self.radio.disconnect(peripheral).await {
                warn!("[LINK] Failed to disconnect {}: {}", peripheral, e);
            }
        }
    }
}
