//! pairgate core - pairing session lifecycle.
//!
//! This crate implements:
//! - Session directories and persisted credential files
//! - The connection engine boundary (events, handle operations)
//! - The per-session lifecycle state machine
//! - Onboarding delivery to the newly paired account
//! - Classification of noisy asynchronous faults

#![forbid(unsafe_code)]

// Core state machine
pub mod lifecycle;
pub mod outcome;

// Services
pub mod onboarding;
pub mod render;

// Infrastructure
pub mod engine;
pub mod fault;
pub mod store;

// Supporting modules
pub mod errors;
pub mod harness;

pub use engine::{Connection, ConnectionEngine, ConnectionEvent, DisconnectReason, Jid, Payload};
pub use errors::{EngineError, PairingError};
pub use lifecycle::{PairingController, PendingSession, SessionPhase, SessionReport, SessionTimings};
pub use outcome::{FailureKind, PairingOutcome};
pub use store::{SessionId, SessionStore};
