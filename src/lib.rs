//! drover — coordinator for fleets of remotely-hosted mobile devices.
//!
//! Each device sits behind a local agent process. The coordinator:
//! - Pairs agents to tenants via short-lived, single-use tokens
//! - Tracks agent liveness, device ownership, and automation sessions
//! - Maps declarative daily-quota templates into ordered action streams
//! - Schedules actions through a priority/retry job queue
//! - Sequences runs against devices with humanized pacing
//! - Fans run progress out to live observers
//!
//! Storage, HTTP transport, and the on-device UI driver are external
//! collaborators; the driver plugs in through the [`run::ActionExecutor`]
//! trait.

pub mod error;
pub mod fanout;
pub mod logging;
pub mod pairing;
pub mod queue;
pub mod registry;
pub mod run;
pub mod settings;
pub mod template;

pub use error::{PairingError, QueueError, RegistryError, RunError};
pub use fanout::{EventFanout, RunEvent, RunEventKind};
pub use pairing::{AgentEnrollment, PairToken, PairedAgent, PairingService};
pub use queue::{Job, JobPriority, JobQueue, JobStatus};
pub use registry::{
    Agent, AgentStatus, Device, DeviceCapabilities, DeviceEndpoints, DeviceSnapshot, DeviceStatus,
    FleetRegistry, HeartbeatMessage, Session, SessionStatus, spawn_sweep,
};
pub use run::{ActionError, ActionExecutor, RunExecutor, RunSnapshot, RunStatus};
pub use settings::Settings;
pub use template::{Action, ActionQuotas, ContentRefs, Template};
