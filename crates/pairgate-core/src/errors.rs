//! Error types for pairgate core.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::DisconnectReason;

/// Errors raised by a connection engine or one of its handles.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    /// Close reason reported alongside the failure, when the engine knows it.
    pub reason: Option<DisconnectReason>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
        }
    }

    pub fn with_reason(message: impl Into<String>, reason: DisconnectReason) -> Self {
        Self {
            message: message.into(),
            reason: Some(reason),
        }
    }
}

/// Errors surfaced by the session store, credential files and the controller.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session directory already exists: {}", .0.display())]
    SessionExists(PathBuf),

    #[error("invalid credential key name: {0}")]
    InvalidKeyName(String),

    #[error("credential encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to render pairing code: {0}")]
    Render(String),
}

pub type PairingResult<T> = Result<T, PairingError>;
