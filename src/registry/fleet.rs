//! Fleet registry: agent liveness, device ownership, session tracking.
//!
//! The registry is the shared source of truth read by both the pairing
//! service (writing new agents) and the run executor (dispatch decisions).
//! All maps are per-row atomic behind `RwLock`; heartbeat processing never
//! blocks dispatch loops.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RegistryError, RegistryResult};
use crate::registry::types::{
    Agent, AgentStatus, Device, DeviceCapabilities, DeviceEndpoints, DeviceSnapshot, DeviceStatus,
    HeartbeatMessage, Session, SessionStatus,
};
use crate::settings::RegistrySettings;

/// Tracks agents, devices, and automation sessions for the whole fleet.
pub struct FleetRegistry {
    agents: RwLock<HashMap<Uuid, Agent>>,
    devices: RwLock<HashMap<String, Device>>,
    /// Current session per device; replaced on open (last-writer-wins).
    sessions: RwLock<HashMap<String, Session>>,
    settings: RegistrySettings,
}

impl FleetRegistry {
    /// Create a registry with the given settings.
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Insert or replace an agent record. Called by the pairing service.
    pub async fn upsert_agent(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        if agents.insert(agent.agent_id, agent.clone()).is_some() {
            tracing::info!("Re-paired agent {} ({})", agent.agent_id, agent.display_name);
        } else {
            tracing::info!("Paired new agent {} ({})", agent.agent_id, agent.display_name);
        }
    }

    /// Look up an agent by id.
    pub async fn agent(&self, agent_id: Uuid) -> RegistryResult<Agent> {
        self.agents
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .ok_or(RegistryError::AgentNotFound { id: agent_id })
    }

    /// Process a liveness report: mark the agent and its devices online.
    pub async fn heartbeat(&self, msg: &HeartbeatMessage) -> RegistryResult<()> {
        {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&msg.agent_id)
                .ok_or(RegistryError::AgentNotFound { id: msg.agent_id })?;
            agent.last_heartbeat = Some(Utc::now());
            agent.uptime_seconds = msg.uptime_seconds;
            agent.app_version = msg.version.clone();
            if agent.status != AgentStatus::Online {
                tracing::info!("Agent {} back online", msg.agent_id);
            }
            agent.status = AgentStatus::Online;
        }

        let mut devices = self.devices.write().await;
        for udid in &msg.udids {
            if let Some(device) = devices.get_mut(udid) {
                // A busy device stays busy; the run executor owns that flag.
                if device.status == DeviceStatus::Offline || device.status == DeviceStatus::Error {
                    device.status = DeviceStatus::Connected;
                }
            }
        }

        Ok(())
    }

    /// Register (or re-register) a device under an agent.
    ///
    /// Re-registration under a different agent is an explicit takeover: the
    /// previous owner loses the device, logged as a warning.
    pub async fn register_device(
        &self,
        udid: impl Into<String>,
        agent_id: Uuid,
        display_name: impl Into<String>,
        platform: impl Into<String>,
        endpoints: DeviceEndpoints,
        capabilities: DeviceCapabilities,
    ) -> RegistryResult<Device> {
        let udid = udid.into();
        self.agent(agent_id).await?;

        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.get(&udid) {
            if let Some(prior) = existing.agent_id {
                if prior != agent_id {
                    tracing::warn!(
                        "Device {} taken over: agent {} -> {}",
                        udid,
                        prior,
                        agent_id
                    );
                }
            }
        }

        let device = Device {
            udid: udid.clone(),
            display_name: display_name.into(),
            platform: platform.into(),
            endpoints,
            capabilities,
            status: DeviceStatus::Connected,
            agent_id: Some(agent_id),
            registered_at: Utc::now(),
        };
        devices.insert(udid, device.clone());
        Ok(device)
    }

    /// Open an automation session against a device.
    ///
    /// Any prior active session for the udid is invalidated first
    /// (last-writer-wins).
    pub async fn open_session(&self, udid: &str) -> RegistryResult<Session> {
        if !self.devices.read().await.contains_key(udid) {
            return Err(RegistryError::DeviceNotFound {
                udid: udid.to_string(),
            });
        }

        let session = Session::new(udid);
        let mut sessions = self.sessions.write().await;
        if let Some(prior) = sessions.get(udid) {
            if prior.status == SessionStatus::Active {
                tracing::warn!(
                    "Replacing active session {} on device {}",
                    prior.session_id,
                    udid
                );
            }
        }
        sessions.insert(udid.to_string(), session.clone());
        Ok(session)
    }

    /// Close the device's session. Closing a closed (or absent) session is
    /// a no-op.
    pub async fn close_session(&self, udid: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(udid) {
            session.status = SessionStatus::Closed;
        }
    }

    /// Composite device view for the executor's dispatch decision.
    pub async fn get_status(&self, udid: &str) -> RegistryResult<DeviceSnapshot> {
        let device = self
            .devices
            .read()
            .await
            .get(udid)
            .cloned()
            .ok_or(RegistryError::DeviceNotFound {
                udid: udid.to_string(),
            })?;

        let agent_online = match device.agent_id {
            Some(agent_id) => self
                .agents
                .read()
                .await
                .get(&agent_id)
                .map(|a| a.status == AgentStatus::Online && !a.deactivated)
                .unwrap_or(false),
            None => false,
        };

        let active_session = self
            .sessions
            .read()
            .await
            .get(udid)
            .filter(|s| s.status == SessionStatus::Active)
            .cloned();

        Ok(DeviceSnapshot {
            device,
            agent_online,
            active_session,
        })
    }

    /// Set a device's status. Used by the executor to flag busy/error.
    pub async fn set_device_status(&self, udid: &str, status: DeviceStatus) -> RegistryResult<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(udid)
            .ok_or(RegistryError::DeviceNotFound {
                udid: udid.to_string(),
            })?;
        device.status = status;
        Ok(())
    }

    /// Take an agent out of rotation without deleting its record.
    pub async fn deactivate_agent(&self, agent_id: Uuid) -> RegistryResult<()> {
        {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&agent_id)
                .ok_or(RegistryError::AgentNotFound { id: agent_id })?;
            agent.deactivated = true;
            agent.status = AgentStatus::Offline;
        }
        self.mark_agent_devices_offline(agent_id).await;
        tracing::info!("Deactivated agent {}", agent_id);
        Ok(())
    }

    /// Mark agents silent past the heartbeat timeout (and their devices)
    /// offline. Returns the number of agents flipped.
    pub async fn sweep_offline(&self) -> usize {
        let timeout = self.settings.heartbeat_timeout();
        let cutoff = Utc::now() - TimeDelta::seconds(timeout.as_secs() as i64);

        let stale: Vec<Uuid> = {
            let mut agents = self.agents.write().await;
            let mut flipped = Vec::new();
            for agent in agents.values_mut() {
                if agent.status == AgentStatus::Online && heartbeat_expired(agent, cutoff) {
                    agent.status = AgentStatus::Offline;
                    flipped.push(agent.agent_id);
                }
            }
            flipped
        };

        for agent_id in &stale {
            tracing::warn!(
                "Agent {} silent for more than {}s, marking offline",
                agent_id,
                timeout.as_secs()
            );
            self.mark_agent_devices_offline(*agent_id).await;
        }

        stale.len()
    }

    async fn mark_agent_devices_offline(&self, agent_id: Uuid) {
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            if device.agent_id == Some(agent_id) && device.status != DeviceStatus::Offline {
                device.status = DeviceStatus::Offline;
            }
        }
    }

    /// Snapshot of all devices.
    pub async fn list_devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Snapshot of all agents.
    pub async fn list_agents(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }
}

/// An agent that has never heartbeated gets the timeout measured from its
/// pairing time, so a freshly paired agent isn't swept before its first
/// report.
fn heartbeat_expired(agent: &Agent, cutoff: DateTime<Utc>) -> bool {
    agent.last_heartbeat.unwrap_or(agent.paired_at) < cutoff
}

/// Spawn the background offline sweep for a registry.
pub fn spawn_sweep(registry: Arc<FleetRegistry>) -> tokio::task::JoinHandle<()> {
    let interval = registry.settings.sweep_interval();
    tokio::spawn(async move {
        tracing::info!("Starting offline sweep with interval {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // Don't sweep immediately on startup
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep_offline().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> Agent {
        Agent {
            agent_id: Uuid::new_v4(),
            tenant_id: "tenant-1".to_string(),
            display_name: "rack-agent".to_string(),
            platform: "ios".to_string(),
            app_version: "1.0.0".to_string(),
            auth_token: "secret".to_string(),
            last_heartbeat: None,
            uptime_seconds: 0,
            status: AgentStatus::Online,
            deactivated: false,
            paired_at: Utc::now(),
        }
    }

    fn registry() -> FleetRegistry {
        FleetRegistry::new(RegistrySettings::default())
    }

    async fn register(reg: &FleetRegistry, udid: &str, agent_id: Uuid) {
        reg.register_device(
            udid,
            agent_id,
            "phone",
            "ios",
            DeviceEndpoints::default(),
            DeviceCapabilities::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_marks_agent_and_devices_online() {
        let reg = registry();
        let mut agent = test_agent();
        agent.status = AgentStatus::Offline;
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;
        register(&reg, "udid-1", agent_id).await;
        reg.set_device_status("udid-1", DeviceStatus::Offline)
            .await
            .unwrap();

        reg.heartbeat(&HeartbeatMessage {
            agent_id,
            udids: vec!["udid-1".to_string()],
            uptime_seconds: 42,
            version: "1.0.1".to_string(),
        })
        .await
        .unwrap();

        let agent = reg.agent(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.uptime_seconds, 42);
        assert_eq!(agent.app_version, "1.0.1");

        let snapshot = reg.get_status("udid-1").await.unwrap();
        assert_eq!(snapshot.device.status, DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent() {
        let reg = registry();
        let result = reg
            .heartbeat(&HeartbeatMessage {
                agent_id: Uuid::new_v4(),
                udids: vec![],
                uptime_seconds: 0,
                version: "1.0.0".to_string(),
            })
            .await;
        assert!(matches!(result, Err(RegistryError::AgentNotFound { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_downgrade_busy_device() {
        let reg = registry();
        let agent = test_agent();
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;
        register(&reg, "udid-1", agent_id).await;
        reg.set_device_status("udid-1", DeviceStatus::Busy)
            .await
            .unwrap();

        reg.heartbeat(&HeartbeatMessage {
            agent_id,
            udids: vec!["udid-1".to_string()],
            uptime_seconds: 1,
            version: "1.0.0".to_string(),
        })
        .await
        .unwrap();

        let snapshot = reg.get_status("udid-1").await.unwrap();
        assert_eq!(snapshot.device.status, DeviceStatus::Busy);
    }

    #[tokio::test]
    async fn test_register_device_takeover_reassigns_owner() {
        let reg = registry();
        let first = test_agent();
        let second = test_agent();
        let (first_id, second_id) = (first.agent_id, second.agent_id);
        reg.upsert_agent(first).await;
        reg.upsert_agent(second).await;

        register(&reg, "udid-1", first_id).await;
        register(&reg, "udid-1", second_id).await;

        let snapshot = reg.get_status("udid-1").await.unwrap();
        assert_eq!(snapshot.device.agent_id, Some(second_id));
    }

    #[tokio::test]
    async fn test_open_session_invalidates_prior() {
        let reg = registry();
        let agent = test_agent();
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;
        register(&reg, "udid-1", agent_id).await;

        let first = reg.open_session("udid-1").await.unwrap();
        let second = reg.open_session("udid-1").await.unwrap();
        assert_ne!(first.session_id, second.session_id);

        let snapshot = reg.get_status("udid-1").await.unwrap();
        assert_eq!(
            snapshot.active_session.unwrap().session_id,
            second.session_id
        );
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let reg = registry();
        let agent = test_agent();
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;
        register(&reg, "udid-1", agent_id).await;

        reg.open_session("udid-1").await.unwrap();
        reg.close_session("udid-1").await;
        reg.close_session("udid-1").await;
        reg.close_session("never-opened").await;

        let snapshot = reg.get_status("udid-1").await.unwrap();
        assert!(snapshot.active_session.is_none());
    }

    #[tokio::test]
    async fn test_sweep_marks_silent_agents_offline() {
        let reg = registry();
        let mut stale = test_agent();
        stale.last_heartbeat = Some(Utc::now() - TimeDelta::seconds(300));
        let stale_id = stale.agent_id;

        let mut fresh = test_agent();
        fresh.last_heartbeat = Some(Utc::now());
        let fresh_id = fresh.agent_id;

        reg.upsert_agent(stale).await;
        reg.upsert_agent(fresh).await;
        register(&reg, "udid-stale", stale_id).await;

        let flipped = reg.sweep_offline().await;
        assert_eq!(flipped, 1);

        assert_eq!(reg.agent(stale_id).await.unwrap().status, AgentStatus::Offline);
        assert_eq!(reg.agent(fresh_id).await.unwrap().status, AgentStatus::Online);

        let snapshot = reg.get_status("udid-stale").await.unwrap();
        assert_eq!(snapshot.device.status, DeviceStatus::Offline);
        assert!(!snapshot.agent_online);
    }

    #[tokio::test]
    async fn test_sweep_spares_freshly_paired_agent() {
        let reg = registry();
        // Paired just now, no heartbeat yet
        let agent = test_agent();
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;

        assert_eq!(reg.sweep_offline().await, 0);
        assert_eq!(reg.agent(agent_id).await.unwrap().status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn test_deactivate_agent_keeps_record() {
        let reg = registry();
        let agent = test_agent();
        let agent_id = agent.agent_id;
        reg.upsert_agent(agent).await;

        reg.deactivate_agent(agent_id).await.unwrap();

        let agent = reg.agent(agent_id).await.unwrap();
        assert!(agent.deactivated);
        assert_eq!(agent.status, AgentStatus::Offline);
    }
}
