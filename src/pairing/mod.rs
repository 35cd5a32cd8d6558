//! Agent pairing via short-lived, single-use tokens.

mod service;

pub use service::{AgentEnrollment, PairToken, PairedAgent, PairingService};
