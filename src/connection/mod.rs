//! Connection management for the sensor link
//!
//! This module handles:
//! - Driving the link state machine against a radio adapter
//! - Step timeouts and delayed auto-retry
//! - Publishing the current state and latest payload to consumers

mod deadline;
mod manager;

pub use manager::{event_channel, ConnectionManager, EventSender};
