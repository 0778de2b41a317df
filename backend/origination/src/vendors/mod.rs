//! Vendor adapters: thin clients for the third-party services the
//! application steps depend on.
//!
//! | Trait                | Used by step | Default implementation        |
//! |----------------------|--------------|-------------------------------|
//! | [`KycProvider`]      | `kyc`        | [`http::HttpKycProvider`]     |
//! | [`BankLinkProvider`] | `bank`       | [`http::HttpBankLinkProvider`]|
//! | [`SignatureProvider`]| `signing`    | [`mock::MockSignatureService`]|
//! | [`Notifier`]         | activation   | [`mock::LogNotifier`]         |
//!
//! Calls are made once; there is no retry or circuit breaking. Every failure
//! surfaces as [`OriginationError::Vendor`](crate::errors::OriginationError).

pub mod http;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::VendorConfig;
use crate::errors::{OriginationError, Result};

/// Who is applying. Passed explicitly to every vendor call that needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl ApplicantProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycSession {
    pub session_id: String,
    /// Where the applicant is sent to complete verification.
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    Approved,
    Declined,
    NeedsReview,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::NeedsReview => "needs_review",
        }
    }
}

/// Body of the identity vendor's webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycWebhookEvent {
    pub contract_id: i64,
    pub session_id: String,
    pub status: KycStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkToken {
    pub link_token: String,
    pub expiration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub institution: String,
    pub account_mask: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSubmission {
    pub contract_id: i64,
    pub contract_number: Option<String>,
    pub signer_name: String,
    /// `data:` URL of the signature bitmap.
    pub signature_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureReceipt {
    pub envelope_id: String,
}

#[async_trait]
pub trait KycProvider: Send + Sync {
    async fn create_session(
        &self,
        contract_id: i64,
        applicant: &ApplicantProfile,
    ) -> Result<KycSession>;

    async fn session_status(&self, session_id: &str) -> Result<KycStatus>;
}

#[async_trait]
pub trait BankLinkProvider: Send + Sync {
    async fn create_link_token(
        &self,
        contract_id: i64,
        applicant: &ApplicantProfile,
    ) -> Result<LinkToken>;

    /// Exchange the token returned by the link widget and resolve the chosen
    /// account.
    async fn exchange_public_token(
        &self,
        public_token: &str,
        account_id: &str,
    ) -> Result<LinkedAccount>;
}

#[async_trait]
pub trait SignatureProvider: Send + Sync {
    async fn submit(&self, submission: &SignatureSubmission) -> Result<SignatureReceipt>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()>;
    async fn send_sms(&self, to: &str, body: &str) -> Result<()>;
}

/// The full set of adapters handed to the step runner and orchestrator.
#[derive(Clone)]
pub struct Vendors {
    pub kyc: Arc<dyn KycProvider>,
    pub bank: Arc<dyn BankLinkProvider>,
    pub esign: Arc<dyn SignatureProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl Vendors {
    /// Build adapters from configuration. Identity and bank vendors are
    /// required; e-signature and notifications fall back to local mocks.
    pub fn from_config(config: &VendorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        let kyc_url = config.kyc_api_url.clone().ok_or_else(|| {
            OriginationError::Config("KYC_API_URL environment variable is required".to_string())
        })?;
        let bank_url = config.bank_api_url.clone().ok_or_else(|| {
            OriginationError::Config("BANK_API_URL environment variable is required".to_string())
        })?;

        let kyc = http::HttpKycProvider::new(http::VendorHttp::new(
            client.clone(),
            "kyc",
            kyc_url,
            config.kyc_api_key.clone(),
        ));
        let bank = http::HttpBankLinkProvider::new(
            http::VendorHttp::new(client.clone(), "bank", bank_url, None),
            config.bank_client_id.clone().unwrap_or_default(),
            config.bank_secret.clone().unwrap_or_default(),
        );

        let esign: Arc<dyn SignatureProvider> = match &config.esign_api_url {
            Some(url) => Arc::new(http::HttpSignatureProvider::new(http::VendorHttp::new(
                client.clone(),
                "esign",
                url.clone(),
                None,
            ))),
            None => Arc::new(mock::MockSignatureService),
        };
        let notifier: Arc<dyn Notifier> = match &config.notify_api_url {
            Some(url) => Arc::new(http::HttpNotifier::new(http::VendorHttp::new(
                client,
                "notify",
                url.clone(),
                config.notify_api_key.clone(),
            ))),
            None => Arc::new(mock::LogNotifier),
        };

        Ok(Self {
            kyc: Arc::new(kyc),
            bank: Arc::new(bank),
            esign,
            notifier,
        })
    }
}
