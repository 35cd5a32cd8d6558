//! Single-use pairing tokens and agent enrollment.
//!
//! Security properties:
//! - Tokens are cryptographically random (32 bytes, base64url-encoded)
//! - Tokens are single-use: the check-and-mark-used step is one critical
//!   section, so of two concurrent consumers exactly one wins
//! - Tokens are ephemeral (in-memory only, never persisted)
//! - Agent auth credentials are validated in constant time

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PairingError, PairingResult};
use crate::registry::{Agent, AgentStatus, FleetRegistry};
use crate::settings::PairingSettings;

/// A short-lived, single-use pairing credential.
#[derive(Debug, Clone)]
pub struct PairToken {
    /// The secret token value.
    pub token: String,
    pub tenant_id: String,
    /// Scan-to-pair payload, rendered externally as a QR code.
    pub payload: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// Metadata the agent submits when consuming a token.
#[derive(Debug, Clone)]
pub struct AgentEnrollment {
    pub display_name: String,
    pub platform: String,
    pub app_version: String,
}

/// Result of a successful pairing: the identity and credential the agent
/// uses from here on. The auth token is returned exactly once.
#[derive(Debug, Clone)]
pub struct PairedAgent {
    pub agent_id: Uuid,
    pub auth_token: String,
}

/// Issues and consumes pairing tokens, writing new agents to the registry.
pub struct PairingService {
    tokens: RwLock<HashMap<String, PairToken>>,
    registry: Arc<FleetRegistry>,
    settings: PairingSettings,
}

impl PairingService {
    pub fn new(registry: Arc<FleetRegistry>, settings: PairingSettings) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            registry,
            settings,
        }
    }

    /// Issue a fresh pairing token for a tenant.
    pub async fn issue(&self, tenant_id: impl Into<String>) -> PairToken {
        let token = generate_token();
        let record = PairToken {
            payload: format!("{}://pair?token={}", self.settings.scheme, token),
            token: token.clone(),
            tenant_id: tenant_id.into(),
            expires_at: Utc::now() + self.settings.token_ttl(),
            used: false,
        };
        self.tokens.write().await.insert(token, record.clone());
        record
    }

    /// Consume a pairing token and enroll the agent.
    ///
    /// The expiry/used check and the used=true flip happen under one write
    /// lock; a concurrent consumer of the same token gets
    /// `TokenAlreadyUsed`.
    pub async fn consume(
        &self,
        token: &str,
        enrollment: AgentEnrollment,
    ) -> PairingResult<PairedAgent> {
        let tenant_id = {
            let mut tokens = self.tokens.write().await;
            let record = tokens.get_mut(token).ok_or(PairingError::TokenNotFound)?;
            if Utc::now() > record.expires_at {
                return Err(PairingError::TokenExpired);
            }
            if record.used {
                return Err(PairingError::TokenAlreadyUsed);
            }
            record.used = true;
            record.tenant_id.clone()
        };

        let agent = Agent {
            agent_id: Uuid::new_v4(),
            tenant_id,
            display_name: enrollment.display_name,
            platform: enrollment.platform,
            app_version: enrollment.app_version,
            auth_token: generate_auth_token(),
            last_heartbeat: None,
            uptime_seconds: 0,
            status: AgentStatus::Online,
            deactivated: false,
            paired_at: Utc::now(),
        };
        let paired = PairedAgent {
            agent_id: agent.agent_id,
            auth_token: agent.auth_token.clone(),
        };
        self.registry.upsert_agent(agent).await;
        Ok(paired)
    }

    /// Validate an agent credential (constant-time comparison).
    pub async fn validate_agent(&self, agent_id: Uuid, auth_token: &str) -> bool {
        match self.registry.agent(agent_id).await {
            Ok(agent) if !agent.deactivated => agent
                .auth_token
                .as_bytes()
                .ct_eq(auth_token.as_bytes())
                .into(),
            _ => false,
        }
    }

    /// Drop expired and consumed tokens. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| !record.used && record.expires_at >= now);
        before - tokens.len()
    }
}

/// Generate a cryptographically random pairing token.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an agent auth credential (32 bytes, hex-encoded = 64 chars).
fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RegistrySettings;

    fn service() -> PairingService {
        let registry = Arc::new(FleetRegistry::new(RegistrySettings::default()));
        PairingService::new(registry, PairingSettings::default())
    }

    fn enrollment() -> AgentEnrollment {
        AgentEnrollment {
            display_name: "rack-agent".to_string(),
            platform: "ios".to_string(),
            app_version: "1.0.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_issue_and_consume() {
        let service = service();
        let token = service.issue("tenant-1").await;
        assert!(token.payload.starts_with("drover://pair?token="));
        assert!(!token.used);

        let paired = service.consume(&token.token, enrollment()).await.unwrap();
        assert_eq!(paired.auth_token.len(), 64);

        let agent = service.registry.agent(paired.agent_id).await.unwrap();
        assert_eq!(agent.tenant_id, "tenant-1");
        assert_eq!(agent.display_name, "rack-agent");
    }

    #[tokio::test]
    async fn test_consume_twice_fails() {
        let service = service();
        let token = service.issue("tenant-1").await;

        service.consume(&token.token, enrollment()).await.unwrap();
        let second = service.consume(&token.token, enrollment()).await;
        assert!(matches!(second, Err(PairingError::TokenAlreadyUsed)));
    }

    #[tokio::test]
    async fn test_consume_unknown_token() {
        let service = service();
        let result = service.consume("no-such-token", enrollment()).await;
        assert!(matches!(result, Err(PairingError::TokenNotFound)));
    }

    #[tokio::test]
    async fn test_consume_expired_token() {
        let service = service();
        let token = service.issue("tenant-1").await;
        service
            .tokens
            .write()
            .await
            .get_mut(&token.token)
            .unwrap()
            .expires_at = Utc::now() - chrono::TimeDelta::seconds(1);

        let result = service.consume(&token.token, enrollment()).await;
        assert!(matches!(result, Err(PairingError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_concurrent_consume_single_winner() {
        let service = Arc::new(service());
        let token = service.issue("tenant-1").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let value = token.token.clone();
            handles.push(tokio::spawn(async move {
                service.consume(&value, enrollment()).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_validate_agent() {
        let service = service();
        let token = service.issue("tenant-1").await;
        let paired = service.consume(&token.token, enrollment()).await.unwrap();

        assert!(
            service
                .validate_agent(paired.agent_id, &paired.auth_token)
                .await
        );
        assert!(!service.validate_agent(paired.agent_id, "wrong").await);
        assert!(
            !service
                .validate_agent(Uuid::new_v4(), &paired.auth_token)
                .await
        );
    }

    #[tokio::test]
    async fn test_validate_deactivated_agent_fails() {
        let service = service();
        let token = service.issue("tenant-1").await;
        let paired = service.consume(&token.token, enrollment()).await.unwrap();

        service
            .registry
            .deactivate_agent(paired.agent_id)
            .await
            .unwrap();
        assert!(
            !service
                .validate_agent(paired.agent_id, &paired.auth_token)
                .await
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let service = service();
        let live = service.issue("tenant-1").await;
        let dead = service.issue("tenant-1").await;
        service
            .tokens
            .write()
            .await
            .get_mut(&dead.token)
            .unwrap()
            .expires_at = Utc::now() - chrono::TimeDelta::seconds(1);
        let used = service.issue("tenant-1").await;
        service.consume(&used.token, enrollment()).await.unwrap();

        assert_eq!(service.purge_expired().await, 2);
        assert!(service.tokens.read().await.contains_key(&live.token));
    }

    #[test]
    fn test_tokens_are_random() {
        assert_ne!(generate_token(), generate_token());
        assert_ne!(generate_auth_token(), generate_auth_token());
    }
}
