//! One-shot result of a pairing request.
//!
//! The HTTP layer awaits the receiver once. Inside the session every
//! competing path (first code, early close, deadline, stream end) calls
//! [`ResponseSlot::fulfill`]; the first call wins and the rest are no-ops.

use tokio::sync::oneshot;

use crate::store::SessionId;

/// Why a session could not produce a pairing code for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Directory creation, credential load or engine open failed.
    InitFailed,
    /// The first pairing code could not be rendered.
    RenderFailed,
    /// The connection closed before a code was shown.
    ClosedBeforePairing,
    /// The account holder revoked the pairing.
    LoggedOut,
    /// No code or pairing within the pairing deadline.
    TimedOut,
    /// The engine stopped emitting events.
    StreamEnded,
    /// The engine reported a live connection without ever showing a code.
    PairedWithoutCode,
}

impl FailureKind {
    pub fn message(self) -> &'static str {
        match self {
            FailureKind::InitFailed => "Failed to initialize pairing session",
            FailureKind::RenderFailed => "Failed to render pairing code",
            FailureKind::ClosedBeforePairing => "Connection closed before a pairing code was issued",
            FailureKind::LoggedOut => "Pairing was revoked by the account holder",
            FailureKind::TimedOut => "Timed out waiting for a pairing code",
            FailureKind::StreamEnded => "Connection engine stopped unexpectedly",
            FailureKind::PairedWithoutCode => "Session was linked without a pairing code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    CodeReady {
        session_id: SessionId,
        qr_data_url: String,
    },
    Failed {
        session_id: SessionId,
        kind: FailureKind,
    },
}

impl PairingOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            PairingOutcome::CodeReady { session_id, .. } => session_id,
            PairingOutcome::Failed { session_id, .. } => session_id,
        }
    }
}

/// Sending half of the one-shot response, owned by the session.
#[derive(Debug)]
pub struct ResponseSlot {
    tx: Option<oneshot::Sender<PairingOutcome>>,
}

impl ResponseSlot {
    pub fn new() -> (Self, oneshot::Receiver<PairingOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Deliver `outcome` if nothing was delivered yet.
    ///
    /// Returns `true` only for the call that consumed the slot and reached a
    /// live receiver. The slot is consumed even when the receiver is gone.
    pub fn fulfill(&mut self, outcome: PairingOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_fulfill_wins() {
        let (mut slot, rx) = ResponseSlot::new();
        let id = SessionId::new("s");

        assert!(slot.fulfill(PairingOutcome::CodeReady {
            session_id: id.clone(),
            qr_data_url: "data:first".into(),
        }));
        assert!(!slot.is_open());
        assert!(!slot.fulfill(PairingOutcome::Failed {
            session_id: id.clone(),
            kind: FailureKind::TimedOut,
        }));

        match rx.await.unwrap() {
            PairingOutcome::CodeReady { qr_data_url, .. } => assert_eq!(qr_data_url, "data:first"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_dropped_receiver_still_consumes_slot() {
        let (mut slot, rx) = ResponseSlot::new();
        drop(rx);
        assert!(!slot.fulfill(PairingOutcome::Failed {
            session_id: SessionId::new("s"),
            kind: FailureKind::InitFailed,
        }));
        assert!(!slot.is_open());
    }
}
