//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{ErrorKind, OriginationError, Result};
use crate::models::{
    ApplicationProgress, ApplicationSnapshot, CommitOutcome, Contract, ContractStatus,
    NewContract, ProgressPatch, StepData,
};
use crate::steps::{CurrentStep, Step};
use crate::vendors::{KycStatus, KycWebhookEvent};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub kyc_webhook_secret: Option<String>,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/contracts", post(create_contract).get(list_contracts))
        .route("/contracts/lookup/:number", get(lookup_contract))
        .route("/contracts/:id", get(get_application))
        .route("/contracts/:id/progress", post(create_progress))
        .route("/contracts/:id/step", patch(update_step))
        .route("/contracts/:id/status", patch(update_status))
        .route("/contracts/:id/steps/:step/complete", post(complete_step))
        .route("/contracts/:id/archive", post(archive_contract))
        .route(
            "/application-progress/:id",
            get(get_progress).patch(patch_progress),
        )
        .route("/webhooks/kyc", post(kyc_webhook))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ContractsResponse {
    pub count: usize,
    pub contracts: Vec<Contract>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    pub code: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Deserialize)]
pub struct StepBody {
    pub step: String,
}

#[derive(Deserialize)]
pub struct StatusBody {
    pub status: String,
}

#[derive(Deserialize)]
pub struct CompleteBody {
    pub data: StepData,
}

#[derive(Deserialize)]
pub struct ArchiveBody {
    pub reason: String,
}

#[derive(Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub committed: bool,
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

/// `Json` extractor whose rejection is an [`ErrorResponse`] body.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = OriginationError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for OriginationError {
    fn from(rejection: JsonRejection) -> Self {
        OriginationError::Validation(rejection.body_text())
    }
}

impl OriginationError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidStep(_)
            | Self::InvalidContractReference(_)
            | Self::Validation(_)
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ContractNotFound(_) | Self::ProgressNotFound(_) => StatusCode::NOT_FOUND,
            Self::IllegalTransition { .. } => StatusCode::CONFLICT,
            Self::Vendor { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::PartialStepCommit { .. }
            | Self::Database(_)
            | Self::Migrate(_)
            | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidStep(_) => "invalid_step",
            Self::InvalidContractReference(_) => "invalid_contract_reference",
            Self::ContractNotFound(_) => "contract_not_found",
            Self::ProgressNotFound(_) => "progress_not_found",
            Self::Validation(_) | Self::Json(_) => "validation",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Vendor { .. } | Self::Http(_) => "vendor",
            Self::PartialStepCommit { .. } => "partial_step_commit",
            Self::Unauthorized(_) => "unauthorized",
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) => "internal",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidStep(step) => Some(json!({ "step": step })),
            Self::ContractNotFound(contract) => Some(json!({ "contract": contract })),
            Self::ProgressNotFound(id) => Some(json!({ "progress_id": id })),
            Self::IllegalTransition { from, to } => Some(json!({ "from": from, "to": to })),
            _ => None,
        }
    }
}

impl IntoResponse for OriginationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.kind() == ErrorKind::Internal {
            error!("Request failed: {self}");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind().as_str().to_string(),
            code: self.code().to_string(),
            retryable: self.is_retryable(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /contracts`
///
/// Originates a contract from a merchant's financing offer.
pub async fn create_contract(
    State(state): State<Arc<ApiState>>,
    ApiJson(offer): ApiJson<NewContract>,
) -> Result<(StatusCode, Json<Contract>)> {
    let contract = db::insert_contract(&state.pool, &offer).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

/// `GET /contracts?status=&archived=`
pub async fn list_contracts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ContractsResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ContractStatus>)
        .transpose()?;
    let contracts = db::list_contracts(&state.pool, status, query.archived).await?;
    Ok(Json(ContractsResponse {
        count: contracts.len(),
        contracts,
    }))
}

/// `GET /contracts/lookup/:number`
///
/// Resolves the contract number printed on an application link.
pub async fn lookup_contract(
    State(state): State<Arc<ApiState>>,
    Path(number): Path<String>,
) -> Result<Json<Contract>> {
    Ok(Json(db::get_contract_by_number(&state.pool, &number).await?))
}

/// `GET /contracts/:id`
///
/// Returns the contract, its progress rows and the derived current step.
pub async fn get_application(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApplicationSnapshot>> {
    Ok(Json(db::load_application(&state.pool, id).await?))
}

/// `POST /contracts/:id/progress`
pub async fn create_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<StepBody>,
) -> Result<Json<ApplicationProgress>> {
    let step: Step = body.step.parse()?;
    Ok(Json(db::ensure_progress(&state.pool, id, step).await?))
}

/// `GET /application-progress/:id`
pub async fn get_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApplicationProgress>> {
    Ok(Json(db::get_progress(&state.pool, id).await?))
}

/// `PATCH /application-progress/:id`
pub async fn patch_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    ApiJson(patch): ApiJson<ProgressPatch>,
) -> Result<Json<ApplicationProgress>> {
    Ok(Json(db::patch_progress(&state.pool, id, &patch).await?))
}

/// `PATCH /contracts/:id/step`
pub async fn update_step(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<StepBody>,
) -> Result<Json<Contract>> {
    let step: CurrentStep = body.step.parse()?;
    Ok(Json(db::update_contract_step(&state.pool, id, step).await?))
}

/// `PATCH /contracts/:id/status`
pub async fn update_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<StatusBody>,
) -> Result<Json<Contract>> {
    let status: ContractStatus = body.status.parse()?;
    Ok(Json(db::update_contract_status(&state.pool, id, status).await?))
}

/// `POST /contracts/:id/steps/:step/complete`
///
/// Marks the step complete and advances the contract in one transaction.
pub async fn complete_step(
    State(state): State<Arc<ApiState>>,
    Path((id, step)): Path<(i64, String)>,
    ApiJson(body): ApiJson<CompleteBody>,
) -> Result<Json<CommitOutcome>> {
    let step: Step = step.parse()?;
    Ok(Json(db::commit_step(&state.pool, id, step, &body.data).await?))
}

/// `POST /contracts/:id/archive`
pub async fn archive_contract(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<ArchiveBody>,
) -> Result<Json<Contract>> {
    Ok(Json(db::archive_contract(&state.pool, id, &body.reason).await?))
}

/// `POST /webhooks/kyc`
///
/// An approved verification completes the `kyc` step; redeliveries are
/// harmless. Other outcomes are acknowledged and logged.
pub async fn kyc_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    ApiJson(event): ApiJson<KycWebhookEvent>,
) -> Result<Json<WebhookAck>> {
    if let Some(secret) = &state.kyc_webhook_secret {
        let given = headers
            .get("x-webhook-secret")
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !secrets_match(given, secret.as_bytes()) {
            warn!("Rejected KYC webhook for contract {}", event.contract_id);
            return Err(OriginationError::Unauthorized(
                "invalid webhook secret".to_string(),
            ));
        }
    }

    if event.status != KycStatus::Approved {
        info!(
            "KYC session {} for contract {} is {}",
            event.session_id,
            event.contract_id,
            event.status.as_str()
        );
        return Ok(Json(WebhookAck {
            received: true,
            committed: false,
        }));
    }

    let data = StepData::Kyc {
        session_id: event.session_id,
        status: event.status.as_str().to_string(),
        verified_at: Utc::now(),
    };
    let outcome = db::commit_step(&state.pool, event.contract_id, Step::Kyc, &data).await?;
    Ok(Json(WebhookAck {
        received: true,
        committed: !outcome.already_completed,
    }))
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(given: &[u8], expected: &[u8]) -> bool {
    let diff = given
        .iter()
        .zip(expected)
        .fold(given.len() ^ expected.len(), |acc, (a, b)| acc | usize::from(a ^ b));
    diff == 0
}
