//! Boundary to the messaging connection engine.
//!
//! The engine owns the protocol handshake and wire I/O. A session sees it
//! only through [`ConnectionEngine::open`], the returned [`Connection`]
//! handle and the stream of [`ConnectionEvent`]s.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::store::CredentialFiles;

/// Normalized address of a messaging account, e.g. `15550001111@s.whatsapp.net`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid(String);

impl Jid {
    /// Strip the device part (`user:device@server` becomes `user@server`).
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once('@') {
            Some((user, server)) => {
                let user = user.split_once(':').map_or(user, |(u, _)| u);
                Self(format!("{user}@{server}"))
            }
            None => Self(raw.split_once(':').map_or(raw, |(u, _)| u).to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the engine closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The account holder revoked this linked device.
    LoggedOut,
    /// The remote service asked for a fresh connection, typically right after a scan.
    RestartRequired,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    BadSession,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::TimedOut,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    pub fn is_logged_out(self) -> bool {
        self == Self::LoggedOut
    }
}

/// Notifications emitted by an open connection, in engine order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A fresh pairing code is ready to be scanned.
    PairingCode(String),
    /// Pairing approved and the connection is live.
    Connected { identity: Option<Jid> },
    Closed { reason: DisconnectReason },
    /// Credential document changed and should be persisted.
    CredentialsUpdated(Value),
}

/// Message content the session can send to the paired account.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Document {
        file_name: String,
        mime_type: String,
        data: Bytes,
    },
    Image {
        url: String,
        caption: String,
    },
    Audio {
        url: String,
        mime_type: String,
    },
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Document { .. } => "document",
            Payload::Image { .. } => "image",
            Payload::Audio { .. } => "audio",
            Payload::Text(_) => "text",
        }
    }
}

pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;

/// A live connection and the stream of its lifecycle events.
pub struct OpenedConnection {
    pub handle: Box<dyn Connection>,
    pub events: EventStream,
}

/// Handle to one remote connection. Owned by exactly one session.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, to: &Jid, payload: Payload) -> Result<(), EngineError>;

    /// Re-establish the transport on the same handle and credentials.
    async fn reconnect(&self) -> Result<(), EngineError>;

    async fn end(&self) -> Result<(), EngineError>;

    /// Identity of the paired account, once the engine knows it.
    fn identity(&self) -> Option<Jid>;
}

#[async_trait]
pub trait ConnectionEngine: Send + Sync {
    /// Open a connection backed by the credential state in `credentials`.
    async fn open(&self, credentials: CredentialFiles) -> Result<OpenedConnection, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_strips_device() {
        assert_eq!(
            Jid::normalize("15550001111:12@s.whatsapp.net").as_str(),
            "15550001111@s.whatsapp.net"
        );
        assert_eq!(
            Jid::normalize("15550001111@s.whatsapp.net").as_str(),
            "15550001111@s.whatsapp.net"
        );
    }

    #[test]
    fn test_status_codes() {
        assert!(DisconnectReason::from_status_code(401).is_logged_out());
        assert_eq!(
            DisconnectReason::from_status_code(515),
            DisconnectReason::RestartRequired
        );
        assert_eq!(DisconnectReason::from_status_code(499), DisconnectReason::Other(499));
    }

    proptest! {
        #[test]
        fn test_normalize_is_idempotent(
            user in "[0-9]{5,15}",
            device in 0u16..100,
            server in "[a-z]{1,8}\\.[a-z]{2,5}",
        ) {
            let once = Jid::normalize(&format!("{user}:{device}@{server}"));
            prop_assert_eq!(once.as_str(), format!("{user}@{server}"));
            prop_assert_eq!(Jid::normalize(once.as_str()), once);
        }
    }
}
