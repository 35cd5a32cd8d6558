//! Device/agent registry.
//!
//! Tracks:
//! - Agent liveness via heartbeats and a background offline sweep
//! - Device ownership and capability descriptors
//! - Automation sessions (at most one active per device)

mod fleet;
mod types;

pub use fleet::{FleetRegistry, spawn_sweep};
pub use types::{
    Agent, AgentStatus, Device, DeviceCapabilities, DeviceEndpoints, DeviceSnapshot, DeviceStatus,
    HeartbeatMessage, Session, SessionStatus,
};
