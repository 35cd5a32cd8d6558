//! Agent, device, and session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a paired agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A local agent process paired to a tenant.
///
/// Agents are never hard-deleted; `deactivated` takes them out of rotation
/// while preserving identity and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub tenant_id: String,
    pub display_name: String,
    pub platform: String,
    pub app_version: String,
    /// Bearer credential returned once at pairing. Never logged.
    #[serde(skip_serializing, default)]
    pub auth_token: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub status: AgentStatus,
    pub deactivated: bool,
    pub paired_at: DateTime<Utc>,
}

/// Connectivity status of an automation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Offline,
    Connected,
    Busy,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Connected => write!(f, "connected"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Network endpoints supplied by the agent at device registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceEndpoints {
    /// Automation port on the agent's local network.
    pub local_automation_port: u16,
    /// Tunnel URL reachable from the coordinator, if any.
    pub public_url: Option<String>,
    pub base_path: Option<String>,
    pub secondary_port: Option<u16>,
    pub stream_port: Option<u16>,
}

/// Capability descriptor reported by the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub bundle_id: Option<String>,
    pub os_version: Option<String>,
}

/// A physical automation target, addressed by its immutable udid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub udid: String,
    pub display_name: String,
    pub platform: String,
    pub endpoints: DeviceEndpoints,
    pub capabilities: DeviceCapabilities,
    pub status: DeviceStatus,
    /// Owning agent; at most one at a time, reassigned on re-registration.
    pub agent_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

/// Status of an automation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// An open automation handle against one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub udid: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(udid: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            udid: udid.into(),
            created_at: Utc::now(),
            status: SessionStatus::Active,
        }
    }
}

/// Periodic liveness report from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub agent_id: Uuid,
    pub udids: Vec<String>,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Composite view of a device used for dispatch decisions.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub agent_online: bool,
    pub active_session: Option<Session>,
}

impl DeviceSnapshot {
    /// Whether the executor may dispatch against this device.
    pub fn dispatchable(&self) -> bool {
        self.agent_online
            && matches!(
                self.device.status,
                DeviceStatus::Connected | DeviceStatus::Busy
            )
    }
}
