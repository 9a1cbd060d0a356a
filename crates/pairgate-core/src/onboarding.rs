//! Onboarding messages sent once to a freshly paired account.
//!
//! Order is fixed: credential document (when present on disk), welcome
//! image, welcome audio, closing text. Sends are sequential; the first
//! failure aborts the rest and is returned to the caller for reporting.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{Connection, Jid, Payload};
use crate::errors::PairingError;
use crate::store::{CredentialFiles, SessionId, CREDS_FILE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardingContent {
    pub document_file_name: String,
    pub document_mime_type: String,
    pub welcome_image_url: String,
    pub welcome_caption: String,
    pub welcome_audio_url: String,
    pub welcome_audio_mime_type: String,
    pub closing_text: String,
}

impl Default for OnboardingContent {
    fn default() -> Self {
        Self {
            document_file_name: CREDS_FILE.to_string(),
            document_mime_type: "application/json".to_string(),
            welcome_image_url: "https://files.pairgate.dev/welcome.jpg".to_string(),
            welcome_caption: "Your account is linked. Keep the attached session file private: \
                              anyone holding it can act as this device."
                .to_string(),
            welcome_audio_url: "https://files.pairgate.dev/welcome.mp4".to_string(),
            welcome_audio_mime_type: "audio/mp4".to_string(),
            closing_text: "Setup complete. This pairing session will now close.".to_string(),
        }
    }
}

/// A failed onboarding step.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub step: &'static str,
    pub error: PairingError,
}

#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Kinds of the payloads that were sent, in order.
    pub sent: Vec<&'static str>,
    /// The credential file was absent, so no document was sent.
    pub document_missing: bool,
    pub failure: Option<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OnboardingPipeline {
    content: OnboardingContent,
}

impl OnboardingPipeline {
    pub fn new(content: OnboardingContent) -> Self {
        Self { content }
    }

    pub fn content(&self) -> &OnboardingContent {
        &self.content
    }

    fn fixed_payloads(&self) -> [Payload; 3] {
        let c = &self.content;
        [
            Payload::Image {
                url: c.welcome_image_url.clone(),
                caption: c.welcome_caption.clone(),
            },
            Payload::Audio {
                url: c.welcome_audio_url.clone(),
                mime_type: c.welcome_audio_mime_type.clone(),
            },
            Payload::Text(c.closing_text.clone()),
        ]
    }

    /// Send the onboarding sequence to `to`, stopping at the first failure.
    pub async fn deliver(
        &self,
        session_id: &SessionId,
        connection: &dyn Connection,
        to: &Jid,
        credentials: &CredentialFiles,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match credentials.read_creds_raw().await {
            Ok(Some(data)) => {
                let document = Payload::Document {
                    file_name: self.content.document_file_name.clone(),
                    mime_type: self.content.document_mime_type.clone(),
                    data,
                };
                if let Err(e) = connection.send(to, document).await {
                    report.failure = Some(DeliveryFailure {
                        step: "document",
                        error: e.into(),
                    });
                    return report;
                }
                report.sent.push("document");
            }
            Ok(None) => {
                debug!(session_id = %session_id, "no credential file on disk, skipping document");
                report.document_missing = true;
            }
            Err(error) => {
                report.failure = Some(DeliveryFailure {
                    step: "document",
                    error,
                });
                return report;
            }
        }

        for payload in self.fixed_payloads() {
            let kind = payload.kind();
            if let Err(e) = connection.send(to, payload).await {
                report.failure = Some(DeliveryFailure {
                    step: kind,
                    error: e.into(),
                });
                return report;
            }
            report.sent.push(kind);
        }

        info!(session_id = %session_id, to = %to, sent = report.sent.len(), "onboarding delivered");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnectionEngine;
    use crate::errors::EngineError;
    use crate::harness::ScriptedEngine;
    use serde_json::json;

    fn jid() -> Jid {
        Jid::normalize("15550001111@s.whatsapp.net")
    }

    #[tokio::test]
    async fn test_full_sequence_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let creds = CredentialFiles::new(tmp.path());
        creds.save_creds(&json!({"registered": true})).await.unwrap();

        let engine = ScriptedEngine::new();
        let opened = engine.open(creds.clone()).await.unwrap();
        let report = OnboardingPipeline::default()
            .deliver(&SessionId::new("s"), opened.handle.as_ref(), &jid(), &creds)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.sent, vec!["document", "image", "audio", "text"]);
        let kinds: Vec<_> = engine.sent().iter().map(|(_, p)| p.kind()).collect();
        assert_eq!(kinds, report.sent);
        match &engine.sent()[0].1 {
            Payload::Document { file_name, data, .. } => {
                assert_eq!(file_name, "creds.json");
                assert!(!data.is_empty());
            }
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_document() {
        let tmp = tempfile::tempdir().unwrap();
        let creds = CredentialFiles::new(tmp.path());

        let engine = ScriptedEngine::new();
        let opened = engine.open(creds.clone()).await.unwrap();
        let report = OnboardingPipeline::default()
            .deliver(&SessionId::new("s"), opened.handle.as_ref(), &jid(), &creds)
            .await;

        assert!(report.document_missing);
        assert_eq!(report.sent, vec!["image", "audio", "text"]);
    }

    #[tokio::test]
    async fn test_failed_send_aborts_remaining() {
        let tmp = tempfile::tempdir().unwrap();
        let creds = CredentialFiles::new(tmp.path());

        let engine = ScriptedEngine::new();
        engine.fail_send(1, EngineError::new("media upload failed"));
        let opened = engine.open(creds.clone()).await.unwrap();
        let report = OnboardingPipeline::default()
            .deliver(&SessionId::new("s"), opened.handle.as_ref(), &jid(), &creds)
            .await;

        assert_eq!(report.sent, vec!["image"]);
        let failure = report.failure.unwrap();
        assert_eq!(failure.step, "audio");
        assert_eq!(engine.sent().len(), 1);
    }
}
