//! Contract and application-progress records, as stored in and read from
//! the database and exchanged over the REST API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OriginationError, Result};
use crate::steps::{derive_current_step, CurrentStep, Step};

/// Lifecycle status of a contract.
///
/// ```text
/// pending ──► active ──► completed
///    │           └──────► cancelled
///    ├──► declined
///    └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContractStatus {
    Pending,
    Active,
    Completed,
    Declined,
    Cancelled,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
        }
    }

    /// Forward-only moves; terminal states have no outgoing edges.
    pub fn can_transition_to(&self, to: ContractStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Declined)
                | (Self::Pending, Self::Cancelled)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Cancelled)
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = OriginationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "declined" => Ok(Self::Declined),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(OriginationError::Validation(format!(
                "unknown contract status '{other}'"
            ))),
        }
    }
}

/// A financing agreement being originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contract {
    pub id: i64,
    pub contract_number: Option<String>,
    pub merchant_id: i64,
    pub customer_id: Option<i64>,
    pub amount: f64,
    pub down_payment: f64,
    pub financed_amount: f64,
    pub term_months: i64,
    /// Annual rate, in percent.
    pub interest_rate: f64,
    pub monthly_payment: f64,
    pub current_step: CurrentStep,
    pub status: ContractStatus,
    pub archived: bool,
    pub archive_reason: Option<String>,
    pub archived_at: Option<i64>,
    pub tokenization_status: Option<String>,
    pub token_id: Option<String>,
    pub blockchain_tx_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contract {
    /// Steps can only be completed or reopened while the contract is still
    /// a pending, unarchived application.
    pub fn ensure_open(&self) -> Result<()> {
        if self.archived {
            return Err(OriginationError::Validation(format!(
                "contract {} is archived",
                self.id
            )));
        }
        if self.status != ContractStatus::Pending {
            return Err(OriginationError::Validation(format!(
                "contract {} is {} and its application can no longer change",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Completion state of one step of one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApplicationProgress {
    pub id: i64,
    pub contract_id: i64,
    pub step: Step,
    pub completed: bool,
    /// JSON-encoded [`StepData`].
    pub data: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApplicationProgress {
    /// Decode the payload, if any.
    pub fn step_data(&self) -> Result<Option<StepData>> {
        self.data
            .as_deref()
            .map(serde_json::from_str::<StepData>)
            .transpose()
            .map_err(OriginationError::from)
    }
}

/// Payment method chosen in the `payment` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Ach,
    DebitCard,
}

/// Step-specific payload stored in `application_progress.data`, tagged by
/// step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum StepData {
    Terms {
        accepted: bool,
        accepted_at: DateTime<Utc>,
        ip_address: Option<String>,
    },
    Kyc {
        session_id: String,
        status: String,
        verified_at: DateTime<Utc>,
    },
    Bank {
        institution: String,
        account_mask: String,
        item_id: String,
        linked_at: DateTime<Utc>,
    },
    Payment {
        method: PaymentMethod,
        autopay: bool,
        confirmed_at: DateTime<Utc>,
    },
    Signing {
        envelope_id: String,
        signer_name: String,
        /// `data:` URL of the captured signature bitmap.
        signature_image: String,
        signed_at: DateTime<Utc>,
        ip_address: Option<String>,
    },
}

impl StepData {
    pub fn step(&self) -> Step {
        match self {
            Self::Terms { .. } => Step::Terms,
            Self::Kyc { .. } => Step::Kyc,
            Self::Bank { .. } => Step::Bank,
            Self::Payment { .. } => Step::Payment,
            Self::Signing { .. } => Step::Signing,
        }
    }

    /// Reject a payload written against the wrong step.
    pub fn ensure_step(&self, step: Step) -> Result<()> {
        if self.step() != step {
            return Err(OriginationError::Validation(format!(
                "payload for step '{}' cannot be stored on step '{step}'",
                self.step()
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Merchant-supplied terms for a new contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContract {
    pub merchant_id: i64,
    pub customer_id: Option<i64>,
    pub amount: f64,
    #[serde(default)]
    pub down_payment: f64,
    pub term_months: i64,
    #[serde(default)]
    pub interest_rate: f64,
}

impl NewContract {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(OriginationError::Validation(msg.to_string()));
        if self.merchant_id <= 0 {
            return invalid("merchant_id must be positive");
        }
        if !(self.amount > 0.0) {
            return invalid("amount must be positive");
        }
        if self.down_payment < 0.0 || self.down_payment >= self.amount {
            return invalid("down_payment must be in [0, amount)");
        }
        if self.term_months <= 0 {
            return invalid("term_months must be positive");
        }
        if self.interest_rate < 0.0 {
            return invalid("interest_rate must not be negative");
        }
        Ok(())
    }

    pub fn financed_amount(&self) -> f64 {
        round_cents(self.amount - self.down_payment)
    }

    /// Amortised monthly payment, rounded to cents.
    pub fn monthly_payment(&self) -> f64 {
        monthly_payment(self.financed_amount(), self.interest_rate, self.term_months)
    }
}

/// Standard annuity payment for `principal` at `annual_rate_pct` over
/// `months`.
pub fn monthly_payment(principal: f64, annual_rate_pct: f64, months: i64) -> f64 {
    if months <= 0 {
        return 0.0;
    }
    let n = months as f64;
    let r = annual_rate_pct / 100.0 / 12.0;
    if r == 0.0 {
        return round_cents(principal / n);
    }
    round_cents(principal * r / (1.0 - (1.0 + r).powf(-n)))
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `{ completed, data }` body of a progress PATCH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPatch {
    pub completed: bool,
    #[serde(default)]
    pub data: Option<StepData>,
}

/// A contract together with its progress rows and the derived current step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    pub contract: Contract,
    pub progress: Vec<ApplicationProgress>,
    pub current_step: CurrentStep,
}

impl ApplicationSnapshot {
    pub fn new(contract: Contract, progress: Vec<ApplicationProgress>) -> Self {
        let current_step = derive_current_step(progress.iter().map(|p| (p.step, p.completed)));
        Self {
            contract,
            progress,
            current_step,
        }
    }

    pub fn row(&self, step: Step) -> Option<&ApplicationProgress> {
        self.progress.iter().find(|p| p.step == step)
    }

    /// Id of the row for `step`, or 0 when it has not been created yet.
    pub fn progress_id(&self, step: Step) -> i64 {
        self.row(step).map(|p| p.id).unwrap_or(0)
    }

    pub fn is_step_completed(&self, step: Step) -> bool {
        self.row(step).map(|p| p.completed).unwrap_or(false)
    }
}

/// Result of committing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub contract: Contract,
    pub progress: ApplicationProgress,
    /// `true` when the step had already been completed and nothing changed.
    pub already_completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(amount: f64, down: f64, months: i64, rate: f64) -> NewContract {
        NewContract {
            merchant_id: 7,
            customer_id: None,
            amount,
            down_payment: down,
            term_months: months,
            interest_rate: rate,
        }
    }

    #[test]
    fn zero_rate_payment_is_straight_division() {
        let c = offer(1000.0, 150.0, 24, 0.0);
        assert_eq!(c.financed_amount(), 850.0);
        assert_eq!(c.monthly_payment(), 35.42);
    }

    #[test]
    fn amortised_payment() {
        // 10_000 over 36 months at 12% APR.
        assert_eq!(monthly_payment(10_000.0, 12.0, 36), 332.14);
    }

    #[test]
    fn validation_rejects_down_payment_over_amount() {
        assert!(offer(1000.0, 1000.0, 12, 0.0).validate().is_err());
        assert!(offer(1000.0, -1.0, 12, 0.0).validate().is_err());
        assert!(offer(1000.0, 0.0, 0, 0.0).validate().is_err());
        assert!(offer(1000.0, 150.0, 24, 0.0).validate().is_ok());
    }

    #[test]
    fn status_transitions_are_forward_only() {
        use ContractStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Declined.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn step_data_is_tagged_by_step() {
        let data = StepData::Payment {
            method: PaymentMethod::DebitCard,
            autopay: true,
            confirmed_at: DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
        };
        let json: serde_json::Value = serde_json::from_str(&data.encode().unwrap()).unwrap();
        assert_eq!(json["step"], "payment");
        assert_eq!(json["method"], "debit_card");
        assert!(data.ensure_step(Step::Payment).is_ok());
        assert!(data.ensure_step(Step::Bank).is_err());
    }

    #[test]
    fn unknown_step_tag_is_rejected() {
        let raw = r#"{"step":"shipping","carrier":"ups"}"#;
        assert!(serde_json::from_str::<StepData>(raw).is_err());
    }
}
