//! Error types for the fleet coordinator.
//!
//! One enum per domain, matching the error taxonomy: validation and
//! contention errors are surfaced synchronously to callers; transient job
//! errors, fatal run errors, and delivery errors are observable only through
//! run status and notification events.

use uuid::Uuid;

/// Errors from the pairing service.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// No token with that value exists.
    #[error("pair token not found")]
    TokenNotFound,

    /// The token exists but its TTL has elapsed.
    #[error("pair token expired")]
    TokenExpired,

    /// The token was already consumed by another agent.
    #[error("pair token already used")]
    TokenAlreadyUsed,
}

/// Errors from the device/agent registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Heartbeat or lookup for an agent that was never paired.
    #[error("agent not found: {id}")]
    AgentNotFound { id: Uuid },

    /// Lookup for a device that was never registered.
    #[error("device not found: {udid}")]
    DeviceNotFound { udid: String },
}

/// Errors from the job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Lookup for a job that does not exist.
    #[error("job not found: {id}")]
    JobNotFound { id: Uuid },

    /// Completion or failure reported for a job not in `running` status.
    #[error("job {id} is not running (status: {status})")]
    JobNotRunning { id: Uuid, status: String },
}

/// Errors from the run executor.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Lookup for a run that does not exist.
    #[error("run not found: {id}")]
    RunNotFound { id: Uuid },

    /// The target device is unknown to the registry.
    #[error("device not found: {udid}")]
    DeviceNotFound { udid: String },

    /// The target device (or its owning agent) is not online.
    #[error("device offline: {udid}")]
    DeviceOffline { udid: String },

    /// Another run already holds the device.
    #[error("device busy: {udid} (claimed by run {run_id})")]
    DeviceBusy { udid: String, run_id: Uuid },

    /// The template maps to zero actions.
    #[error("template produces no actions")]
    TemplateEmpty,

    /// A control request against a run that is not in a controllable state.
    #[error("run {id} is not running (status: {status})")]
    NotRunning { id: Uuid, status: String },
}

/// Result type for pairing operations.
pub type PairingResult<T> = std::result::Result<T, PairingError>;

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Result type for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type for run operations.
pub type RunResult<T> = std::result::Result<T, RunError>;
