//! HTTP client for the origination REST API, usable as the orchestrator's
//! [`ProgressBackend`].

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::api::ErrorResponse;
use crate::errors::{OriginationError, Result};
use crate::models::{
    ApplicationProgress, ApplicationSnapshot, CommitOutcome, Contract, ContractStatus,
    NewContract, ProgressPatch, StepData,
};
use crate::orchestrator::ProgressBackend;
use crate::steps::{CurrentStep, Step};

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `POST /contracts`
    pub async fn create_contract(&self, offer: &NewContract) -> Result<Contract> {
        self.send(Method::POST, &["contracts"], Some(offer)).await
    }

    /// `GET /contracts/lookup/:number`
    pub async fn lookup(&self, contract_number: &str) -> Result<Contract> {
        self.send::<(), _>(
            Method::GET,
            &["contracts", "lookup", contract_number],
            None,
        )
        .await
    }

    /// Join `segments` onto the base URL, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| OriginationError::Config(format!("invalid API base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| OriginationError::Config("API base URL cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B, R>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        let mut req = self.client.request(method.clone(), url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        debug!("{method} {path} → {status}");

        if status.is_success() {
            return Ok(resp.json::<R>().await?);
        }
        let body = resp.json::<ErrorResponse>().await.ok();
        Err(decode_error(status, body))
    }
}

/// Rebuild a typed error from an API error body.
fn decode_error(status: StatusCode, body: Option<ErrorResponse>) -> OriginationError {
    let Some(body) = body else {
        return OriginationError::vendor("api", status.to_string());
    };
    let detail = |key: &str| {
        body.details
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    match body.code.as_str() {
        "invalid_step" => OriginationError::InvalidStep(detail("step")),
        "contract_not_found" => OriginationError::ContractNotFound(detail("contract")),
        "progress_not_found" => OriginationError::ProgressNotFound(
            body.details
                .as_ref()
                .and_then(|d| d.get("progress_id"))
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
        ),
        "illegal_transition" => OriginationError::IllegalTransition {
            from: detail("from"),
            to: detail("to"),
        },
        _ if status.is_server_error() => OriginationError::vendor("api", body.error),
        _ => OriginationError::Validation(body.error),
    }
}

#[async_trait]
impl ProgressBackend for ApiClient {
    async fn load_application(&self, contract_id: i64) -> Result<ApplicationSnapshot> {
        self.send::<(), _>(Method::GET, &["contracts", &contract_id.to_string()], None)
            .await
    }

    async fn ensure_progress(&self, contract_id: i64, step: Step) -> Result<ApplicationProgress> {
        self.send(
            Method::POST,
            &["contracts", &contract_id.to_string(), "progress"],
            Some(&json!({ "step": step })),
        )
        .await
    }

    async fn patch_progress(
        &self,
        progress_id: i64,
        patch: &ProgressPatch,
    ) -> Result<ApplicationProgress> {
        self.send(
            Method::PATCH,
            &["application-progress", &progress_id.to_string()],
            Some(patch),
        )
        .await
    }

    async fn patch_contract_step(&self, contract_id: i64, step: CurrentStep) -> Result<Contract> {
        self.send(
            Method::PATCH,
            &["contracts", &contract_id.to_string(), "step"],
            Some(&json!({ "step": step })),
        )
        .await
    }

    async fn patch_contract_status(
        &self,
        contract_id: i64,
        status: ContractStatus,
    ) -> Result<Contract> {
        self.send(
            Method::PATCH,
            &["contracts", &contract_id.to_string(), "status"],
            Some(&json!({ "status": status })),
        )
        .await
    }

    async fn commit_step(
        &self,
        contract_id: i64,
        step: Step,
        data: StepData,
    ) -> Result<CommitOutcome> {
        self.send(
            Method::POST,
            &["contracts", &contract_id.to_string(), "steps", step.as_str(), "complete"],
            Some(&json!({ "data": data })),
        )
        .await
    }
}
