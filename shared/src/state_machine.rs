//! Link State Machine
//!
//! Defines the connection lifecycle (scan, connect, discover, subscribe)
//! and the side effects each transition requires. The machine performs no
//! I/O itself: [`LinkStateMachine::process_event`] returns [`LinkAction`]s
//! for a driver to carry out against the radio and the clock.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::{codec, link, LinkConfig};

/// Attempt counter stamped onto radio requests and their completions
pub type Epoch = u64;

/// Identifies one armed step timeout
pub type TimeoutToken = u64;

/// Reason used when the radio is off or unavailable
pub const REASON_RADIO_UNAVAILABLE: &str = "radio unavailable";

/// Reason used when the connect request is rejected
pub const REASON_CONNECT_FAILED: &str = "failed to connect";

/// Reason used for a disconnect that carries no error
pub const REASON_DISCONNECTED: &str = "Disconnected, retrying";

/// Opaque identity of a peripheral as reported by the radio adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Radio power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

/// Current step of the connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribed,
    Failed(String),
    Disconnected(String),
}

impl ConnectionState {
    /// Human-readable description, also used in timeout reasons
    pub fn description(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning...",
            Self::Connecting => "Connecting...",
            Self::DiscoveringServices => "Discovering services",
            Self::DiscoveringCharacteristics => "Discovering characteristics",
            Self::Subscribed => "Subscribed",
            Self::Failed(reason) | Self::Disconnected(reason) => reason,
        }
    }

    /// States that must make progress within the step timeout
    pub fn has_timeout(&self) -> bool {
        matches!(
            self,
            Self::Scanning
                | Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
        )
    }

    /// States in which a live connection to the candidate exists
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::DiscoveringCharacteristics | Self::Subscribed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Completions and notifications reported by the radio adapter
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A peripheral was seen during a scan
    PeripheralDiscovered(DiscoveredPeripheral),
    /// Connect request succeeded
    Connected { peripheral: PeripheralId },
    /// Connect request failed
    ConnectFailed { peripheral: PeripheralId, reason: String },
    /// Service discovery finished
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },
    /// Service or characteristic discovery failed
    DiscoveryFailed { peripheral: PeripheralId, reason: String },
    /// Characteristic discovery finished for one service
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A notified characteristic delivered a new value
    ValueUpdated { characteristic: Uuid, value: Bytes },
    /// The peripheral dropped the connection
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
}

/// Everything the state machine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Radio power changed (or was re-evaluated)
    PowerChanged(PowerState),
    /// Radio completion tagged with the epoch of the request
    Radio { epoch: Epoch, event: RadioEvent },
    /// An armed step timeout fired
    TimeoutElapsed { token: TimeoutToken },
    /// The auto-retry delay for an attempt elapsed
    RetryDue { epoch: Epoch },
    /// Manual retry command
    RetryRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    StartScan {
        epoch: Epoch,
    },
    StopScan,
    Connect {
        epoch: Epoch,
        peripheral: PeripheralId,
    },
    CancelConnection {
        peripheral: PeripheralId,
    },
    DiscoverServices {
        epoch: Epoch,
        peripheral: PeripheralId,
    },
    DiscoverCharacteristics {
        epoch: Epoch,
        peripheral: PeripheralId,
        service: Uuid,
        filter: Vec<Uuid>,
    },
    SetNotify {
        epoch: Epoch,
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    ArmTimeout {
        token: TimeoutToken,
        after: Duration,
    },
    CancelTimeout,
    ScheduleRetry {
        epoch: Epoch,
        after: Duration,
    },
    CancelRetry,
    PublishPayload(String),
    /// Query the radio power state and feed it back as `PowerChanged`
    EvaluatePower,
}

/// Bounded auto-retry counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    count: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// Spend one attempt; `false` once the budget is used up
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.count += 1;
        true
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// The connection lifecycle state machine
#[derive(Debug)]
pub struct LinkStateMachine {
    config: LinkConfig,
    state: ConnectionState,
    budget: RetryBudget,
    epoch: Epoch,
    next_token: TimeoutToken,
    active_timeout: Option<TimeoutToken>,
    retry_pending: bool,
    powered: bool,
    candidate: Option<PeripheralId>,
    notify: Option<Uuid>,
    payload: String,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new(config: LinkConfig) -> Self {
        let budget = RetryBudget::new(config.max_retries);
        Self {
            config,
            state: ConnectionState::Idle,
            budget,
            epoch: 0,
            next_token: 0,
            active_timeout: None,
            retry_pending: false,
            powered: false,
            candidate: None,
            notify: None,
            payload: String::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.budget.count()
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn active_timeout(&self) -> Option<TimeoutToken> {
        self.active_timeout
    }

    pub fn candidate(&self) -> Option<&PeripheralId> {
        self.candidate.as_ref()
    }

    pub fn notify_characteristic(&self) -> Option<Uuid> {
        self.notify
    }

    /// Latest decoded payload
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Process an event and return the side effects to perform, in order
    pub fn process_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        match event {
            LinkEvent::PowerChanged(PowerState::On) => {
                self.powered = true;
                self.start_scanning(&mut actions);
            }
            LinkEvent::PowerChanged(PowerState::Off) => {
                self.powered = false;
                self.fail(REASON_RADIO_UNAVAILABLE.into(), &mut actions);
            }
            LinkEvent::Radio { epoch, event } => {
                // Completions from an abandoned attempt
                if epoch == self.epoch {
                    self.on_radio_event(event, &mut actions);
                }
            }
            LinkEvent::TimeoutElapsed { token } => {
                if self.active_timeout == Some(token) {
                    self.active_timeout = None;
                    let reason = format!("timeout during {}", self.state.description());
                    self.fail(reason, &mut actions);
                }
            }
            LinkEvent::RetryDue { epoch } => {
                if epoch == self.epoch && self.retry_pending {
                    self.retry_pending = false;
                    if self.powered && matches!(self.state, ConnectionState::Disconnected(_)) {
                        self.start_scanning(&mut actions);
                    }
                }
            }
            LinkEvent::RetryRequested => {
                self.abandon_attempt(&mut actions);
                self.transition(ConnectionState::Idle, &mut actions);
                self.payload = link::NO_PAYLOAD.into();
                actions.push(LinkAction::PublishPayload(self.payload.clone()));
                actions.push(LinkAction::EvaluatePower);
            }
        }

        actions
    }

    fn on_radio_event(&mut self, event: RadioEvent, actions: &mut Vec<LinkAction>) {
        let current = self.state.clone();
        let target = self.config.target.clone();

        match (current, event) {
            (ConnectionState::Scanning, RadioEvent::PeripheralDiscovered(found)) => {
                if found.name.as_deref() == Some(target.name.as_str()) {
                    self.transition(ConnectionState::Connecting, actions);
                    actions.push(LinkAction::Connect {
                        epoch: self.epoch,
                        peripheral: found.id.clone(),
                    });
                    self.candidate = Some(found.id);
                }
            }
            (ConnectionState::Connecting, RadioEvent::Connected { peripheral })
                if self.is_candidate(&peripheral) =>
            {
                self.transition(ConnectionState::DiscoveringServices, actions);
                actions.push(LinkAction::DiscoverServices {
                    epoch: self.epoch,
                    peripheral,
                });
            }
            (ConnectionState::Connecting, RadioEvent::ConnectFailed { peripheral, .. })
                if self.is_candidate(&peripheral) =>
            {
                self.fail(REASON_CONNECT_FAILED.into(), actions);
            }
            (
                ConnectionState::DiscoveringServices,
                RadioEvent::ServicesDiscovered {
                    peripheral,
                    services,
                },
            ) if self.is_candidate(&peripheral) && services.contains(&target.service) => {
                self.transition(ConnectionState::DiscoveringCharacteristics, actions);
                actions.push(LinkAction::DiscoverCharacteristics {
                    epoch: self.epoch,
                    peripheral,
                    service: target.service,
                    filter: vec![target.notify],
                });
            }
            (
                ConnectionState::DiscoveringCharacteristics,
                RadioEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics,
                },
            ) if self.is_candidate(&peripheral)
                && service == target.service
                && characteristics.contains(&target.notify) =>
            {
                self.notify = Some(target.notify);
                actions.push(LinkAction::SetNotify {
                    epoch: self.epoch,
                    peripheral,
                    service,
                    characteristic: target.notify,
                    enabled: true,
                });
                self.transition(ConnectionState::Subscribed, actions);
                self.budget.reset();
            }
            (ConnectionState::Subscribed, RadioEvent::ValueUpdated { characteristic, value })
                if self.notify == Some(characteristic) =>
            {
                self.payload = codec::decode_text(&value);
                actions.push(LinkAction::PublishPayload(self.payload.clone()));
            }
            (state, RadioEvent::Disconnected { peripheral, error })
                if state.is_connected() && self.is_candidate(&peripheral) =>
            {
                self.on_disconnect(error, actions);
            }
            // Discovery errors, a missing target service or characteristic
            // and non-matching peripherals all wait for the step timeout.
            _ => {}
        }
    }

    fn on_disconnect(&mut self, error: Option<String>, actions: &mut Vec<LinkAction>) {
        let reason = match error {
            Some(err) => format!("Disconnected: {err}"),
            None => REASON_DISCONNECTED.into(),
        };

        // The link is already gone; nothing to cancel on the radio
        self.candidate = None;
        self.notify = None;
        self.epoch += 1;
        self.transition(ConnectionState::Disconnected(reason), actions);

        // Exhaustion is silent: the state keeps its disconnect reason
        if self.budget.try_consume() {
            self.retry_pending = true;
            actions.push(LinkAction::ScheduleRetry {
                epoch: self.epoch,
                after: self.config.retry_delay,
            });
        }
    }

    fn start_scanning(&mut self, actions: &mut Vec<LinkAction>) {
        self.abandon_attempt(actions);
        self.transition(ConnectionState::Scanning, actions);
        actions.push(LinkAction::StartScan { epoch: self.epoch });
    }

    fn fail(&mut self, reason: String, actions: &mut Vec<LinkAction>) {
        self.abandon_attempt(actions);
        self.transition(ConnectionState::Failed(reason), actions);
    }

    /// Drop the current attempt so its late completions are ignored
    fn abandon_attempt(&mut self, actions: &mut Vec<LinkAction>) {
        if let Some(peripheral) = self.candidate.take() {
            actions.push(LinkAction::CancelConnection { peripheral });
        }
        if self.retry_pending {
            self.retry_pending = false;
            actions.push(LinkAction::CancelRetry);
        }
        self.notify = None;
        self.epoch += 1;
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<LinkAction>) {
        if self.active_timeout.take().is_some() {
            actions.push(LinkAction::CancelTimeout);
        }
        if self.state == ConnectionState::Scanning {
            actions.push(LinkAction::StopScan);
        }

        if next.has_timeout() {
            self.next_token += 1;
            self.active_timeout = Some(self.next_token);
            actions.push(LinkAction::ArmTimeout {
                token: self.next_token,
                after: self.config.step_timeout,
            });
        }
        self.state = next;
    }

    fn is_candidate(&self, peripheral: &PeripheralId) -> bool {
        self.candidate.as_ref() == Some(peripheral)
    }
}
