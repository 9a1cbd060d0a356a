//! Classification of asynchronous faults.
//!
//! Engines routinely raise errors that nobody can act on: the remote side
//! throttling us, another client taking over the connection, or a request
//! timing out while the socket cycles. Every async boundary in a session
//! hands its errors to [`FaultFilter::report`], which drops those and logs
//! the rest against the session that produced them.

use tracing::warn;

use crate::store::SessionId;

/// Substrings of error messages that are discarded without logging.
pub const BENIGN_FAULT_PATTERNS: &[&str] = &[
    "rate-overlimit",
    "rate limit",
    "conflict",
    "timed out",
    "timeout",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Actionable,
}

#[derive(Debug, Clone)]
pub struct FaultFilter {
    patterns: Vec<String>,
}

impl Default for FaultFilter {
    fn default() -> Self {
        Self::new(BENIGN_FAULT_PATTERNS.iter().copied())
    }
}

impl FaultFilter {
    pub fn new<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            patterns: patterns.into_iter().map(str::to_ascii_lowercase).collect(),
        }
    }

    pub fn classify(&self, message: &str) -> FaultClass {
        let message = message.to_ascii_lowercase();
        if self.patterns.iter().any(|p| message.contains(p.as_str())) {
            FaultClass::Benign
        } else {
            FaultClass::Actionable
        }
    }

    /// Log `error` unless it is benign. Never changes session state.
    pub fn report(
        &self,
        session_id: Option<&SessionId>,
        context: &str,
        error: &(dyn std::error::Error + 'static),
    ) -> FaultClass {
        let class = self.classify(&error.to_string());
        if class == FaultClass::Actionable {
            match session_id {
                Some(id) => warn!(session_id = %id, context, error = %error, "unhandled fault"),
                None => warn!(context, error = %error, "unhandled fault"),
            }
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use proptest::prelude::*;

    #[test]
    fn test_known_noise_is_benign() {
        let filter = FaultFilter::default();
        assert_eq!(filter.classify("rate-overlimit"), FaultClass::Benign);
        assert_eq!(filter.classify("Stream Errored (conflict)"), FaultClass::Benign);
        assert_eq!(filter.classify("Timed Out"), FaultClass::Benign);
        assert_eq!(filter.classify("disk full"), FaultClass::Actionable);
    }

    #[test]
    fn test_report_returns_class() {
        let filter = FaultFilter::default();
        let id = SessionId::new("s");
        let benign = EngineError::new("query timeout");
        let real = EngineError::new("bad mac");
        assert_eq!(filter.report(Some(&id), "send", &benign), FaultClass::Benign);
        assert_eq!(filter.report(None, "send", &real), FaultClass::Actionable);
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let filter = FaultFilter::new(["ECONNRESET"]);
        assert_eq!(filter.classify("read econnreset"), FaultClass::Benign);
        assert_eq!(filter.classify("timed out"), FaultClass::Actionable);
    }

    proptest! {
        #[test]
        fn test_any_message_containing_pattern_is_benign(
            prefix in "[a-zA-Z ]{0,20}",
            suffix in "[a-zA-Z ]{0,20}",
            idx in 0..BENIGN_FAULT_PATTERNS.len(),
        ) {
            let filter = FaultFilter::default();
            let message = format!("{prefix}{}{suffix}", BENIGN_FAULT_PATTERNS[idx].to_uppercase());
            prop_assert_eq!(filter.classify(&message), FaultClass::Benign);
        }
    }
}
