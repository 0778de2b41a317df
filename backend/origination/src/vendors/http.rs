//! HTTP implementations of the vendor traits, built on one generic JSON
//! client wrapper.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    ApplicantProfile, BankLinkProvider, KycProvider, KycSession, KycStatus, LinkToken,
    LinkedAccount, Notifier, SignatureProvider, SignatureReceipt, SignatureSubmission,
};
use crate::errors::{OriginationError, Result};

/// Shared request plumbing: base URL, optional bearer key, status checking.
#[derive(Debug, Clone)]
pub struct VendorHttp {
    client: Client,
    vendor: &'static str,
    base_url: String,
    api_key: Option<String>,
}

impl VendorHttp {
    pub fn new(
        client: Client,
        vendor: &'static str,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            vendor,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Join `segments` onto the base URL, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            OriginationError::Config(format!("invalid {} base URL: {e}", self.vendor))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                OriginationError::Config(format!("{} base URL cannot take a path", self.vendor))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn post_json<B, R>(&self, segments: &[&str], body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(segments)?;
        let mut req = self.client.post(url.clone()).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        self.finish(url.path(), req).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, segments: &[&str]) -> Result<R> {
        let url = self.url(segments)?;
        let mut req = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        self.finish(url.path(), req).await
    }

    async fn finish<R: DeserializeOwned>(
        &self,
        path: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<R> {
        let resp = req.send().await.map_err(|e| {
            warn!("{} request to {path} failed: {e}", self.vendor);
            OriginationError::vendor(self.vendor, e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("{} returned {status} for {path}", self.vendor);
            return Err(OriginationError::vendor(
                self.vendor,
                format!("{status}: {}", body.trim()),
            ));
        }

        debug!("{} {path} → {status}", self.vendor);
        resp.json::<R>()
            .await
            .map_err(|e| OriginationError::vendor(self.vendor, format!("malformed response: {e}")))
    }
}

// ─────────────────────────────────────────────────────────
// Identity verification
// ─────────────────────────────────────────────────────────

pub struct HttpKycProvider {
    http: VendorHttp,
}

impl HttpKycProvider {
    pub fn new(http: VendorHttp) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct SessionCreated {
    id: String,
    url: String,
}

#[derive(Deserialize)]
struct SessionState {
    status: KycStatus,
}

#[async_trait]
impl KycProvider for HttpKycProvider {
    async fn create_session(
        &self,
        contract_id: i64,
        applicant: &ApplicantProfile,
    ) -> Result<KycSession> {
        let created: SessionCreated = self
            .http
            .post_json(
                &["sessions"],
                &json!({
                    "reference": contract_id.to_string(),
                    "first_name": applicant.first_name,
                    "last_name": applicant.last_name,
                    "email": applicant.email,
                    "phone": applicant.phone,
                }),
            )
            .await?;
        Ok(KycSession {
            session_id: created.id,
            redirect_url: created.url,
        })
    }

    async fn session_status(&self, session_id: &str) -> Result<KycStatus> {
        let state: SessionState = self.http.get_json(&["sessions", session_id]).await?;
        Ok(state.status)
    }
}

// ─────────────────────────────────────────────────────────
// Bank-data aggregation
// ─────────────────────────────────────────────────────────

pub struct HttpBankLinkProvider {
    http: VendorHttp,
    client_id: String,
    secret: String,
}

impl HttpBankLinkProvider {
    pub fn new(http: VendorHttp, client_id: String, secret: String) -> Self {
        Self {
            http,
            client_id,
            secret,
        }
    }
}

#[derive(Deserialize)]
struct Exchanged {
    access_token: String,
    item_id: String,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountEntry>,
    item: ItemEntry,
}

#[derive(Deserialize)]
struct AccountEntry {
    account_id: String,
    mask: Option<String>,
}

#[derive(Deserialize)]
struct ItemEntry {
    institution_name: Option<String>,
}

#[async_trait]
impl BankLinkProvider for HttpBankLinkProvider {
    async fn create_link_token(
        &self,
        contract_id: i64,
        applicant: &ApplicantProfile,
    ) -> Result<LinkToken> {
        self.http
            .post_json(
                &["link", "token", "create"],
                &json!({
                    "client_id": self.client_id,
                    "secret": self.secret,
                    "client_name": "Financing Application",
                    "user": {
                        "client_user_id": contract_id.to_string(),
                        "legal_name": applicant.full_name(),
                        "email_address": applicant.email,
                    },
                    "products": ["auth"],
                }),
            )
            .await
    }

    async fn exchange_public_token(
        &self,
        public_token: &str,
        account_id: &str,
    ) -> Result<LinkedAccount> {
        let exchanged: Exchanged = self
            .http
            .post_json(
                &["item", "public_token", "exchange"],
                &json!({
                    "client_id": self.client_id,
                    "secret": self.secret,
                    "public_token": public_token,
                }),
            )
            .await?;

        let accounts: AccountsResponse = self
            .http
            .post_json(
                &["accounts", "get"],
                &json!({
                    "client_id": self.client_id,
                    "secret": self.secret,
                    "access_token": exchanged.access_token,
                }),
            )
            .await?;

        let account = accounts
            .accounts
            .into_iter()
            .find(|a| a.account_id == account_id)
            .ok_or_else(|| {
                OriginationError::vendor("bank", format!("account {account_id} not found on item"))
            })?;

        Ok(LinkedAccount {
            institution: accounts
                .item
                .institution_name
                .unwrap_or_else(|| "Unknown institution".to_string()),
            account_mask: account.mask.unwrap_or_default(),
            item_id: exchanged.item_id,
        })
    }
}

// ─────────────────────────────────────────────────────────
// E-signature
// ─────────────────────────────────────────────────────────

pub struct HttpSignatureProvider {
    http: VendorHttp,
}

impl HttpSignatureProvider {
    pub fn new(http: VendorHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SignatureProvider for HttpSignatureProvider {
    async fn submit(&self, submission: &SignatureSubmission) -> Result<SignatureReceipt> {
        self.http.post_json(&["envelopes"], submission).await
    }
}

// ─────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────

pub struct HttpNotifier {
    http: VendorHttp,
}

impl HttpNotifier {
    pub fn new(http: VendorHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .post_json(&["email"], &json!({ "to": to, "subject": subject, "body": body }))
            .await?;
        Ok(())
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .post_json(&["sms"], &json!({ "to": to, "body": body }))
            .await?;
        Ok(())
    }
}
