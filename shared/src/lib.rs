//! Sensor Link Shared Types
//!
//! This crate provides the connection lifecycle state machine and the
//! payload/CSV codec shared by the link driver and its consumers.

pub mod codec;
pub mod state_machine;

use std::time::Duration;
use uuid::Uuid;

/// Link parameters for the sensor peripheral
pub mod link {
    use uuid::Uuid;

    /// Advertised name of the sensor peripheral
    pub const TARGET_NAME: &str = "MPY ESP32";

    /// UART service exposed by the peripheral
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);

    /// Characteristic the peripheral notifies readings on
    pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

    /// Deadline for every step between scanning and subscription
    pub const STEP_TIMEOUT_MS: u64 = 5000;

    /// Delay before re-scanning after an unsolicited disconnect
    pub const RETRY_DELAY_MS: u64 = 1000;

    /// Maximum auto-retries before the link stays disconnected
    pub const MAX_RETRIES: u32 = 5;

    /// Payload shown after a manual retry until the next reading
    pub const NO_PAYLOAD: &str = "---";
}

/// Which peripheral, service and characteristic the link acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    /// Exact advertised name to match
    pub name: String,
    /// Service that groups the notify characteristic
    pub service: Uuid,
    /// Characteristic carrying sensor payloads
    pub notify: Uuid,
}

impl Default for TargetIdentity {
    fn default() -> Self {
        Self {
            name: link::TARGET_NAME.into(),
            service: link::SERVICE_UUID,
            notify: link::NOTIFY_UUID,
        }
    }
}

/// Configuration for the connection lifecycle
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Peripheral selection
    pub target: TargetIdentity,
    /// Timeout applied to each active step
    pub step_timeout: Duration,
    /// Delay before an auto-retry re-enters scanning
    pub retry_delay: Duration,
    /// Auto-retry budget
    pub max_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: TargetIdentity::default(),
            step_timeout: Duration::from_millis(link::STEP_TIMEOUT_MS),
            retry_delay: Duration::from_millis(link::RETRY_DELAY_MS),
            max_retries: link::MAX_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target() {
        let target = TargetIdentity::default();
        assert_eq!(target.name, "MPY ESP32");
        assert_eq!(
            target.service.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            target.notify.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_default_link_config() {
        let config = LinkConfig::default();
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.max_retries, 5);
    }
}
