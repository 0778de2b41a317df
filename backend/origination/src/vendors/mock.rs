//! Local stand-ins used when no vendor endpoint is configured.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{Notifier, SignatureProvider, SignatureReceipt, SignatureSubmission};
use crate::errors::{OriginationError, Result};

/// Mock e-signature service: accepts any non-empty signature image and
/// issues an envelope id.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSignatureService;

#[async_trait]
impl SignatureProvider for MockSignatureService {
    async fn submit(&self, submission: &SignatureSubmission) -> Result<SignatureReceipt> {
        if !submission.signature_image.starts_with("data:image/") {
            return Err(OriginationError::vendor(
                "esign",
                "signature image must be a data URL",
            ));
        }
        let envelope_id = format!("env_{}", Uuid::new_v4().simple());

        info!(
            "Mock e-sign envelope {envelope_id} for contract {} signed by {}",
            submission.contract_id, submission.signer_name
        );
        Ok(SignatureReceipt { envelope_id })
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_email(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        info!("[notify] email to {to}: {subject}");
        Ok(())
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        info!("[notify] sms to {to}: {body}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_esign_issues_unique_envelope_ids() {
        let submission = SignatureSubmission {
            contract_id: 42,
            contract_number: Some("FIN-20240101-000042".into()),
            signer_name: "Ada Lovelace".into(),
            signature_image: "data:image/bmp;base64,Qk0=".into(),
        };
        let first = MockSignatureService.submit(&submission).await.unwrap();
        let second = MockSignatureService.submit(&submission).await.unwrap();

        let id = first.envelope_id.strip_prefix("env_").unwrap();
        let parsed = Uuid::parse_str(id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_ne!(first.envelope_id, second.envelope_id);
    }

    #[tokio::test]
    async fn mock_esign_rejects_non_image_payloads() {
        let err = MockSignatureService
            .submit(&SignatureSubmission {
                contract_id: 1,
                contract_number: None,
                signer_name: "Ada".into(),
                signature_image: "hello".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OriginationError::Vendor { .. }));
    }
}
