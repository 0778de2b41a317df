//! Step components: turn what the applicant entered on one step into the
//! [`StepData`] payload that completes it, calling vendors where needed.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{OriginationError, Result};
use crate::models::{ApplicationSnapshot, PaymentMethod, StepData};
use crate::orchestrator::ApplicationContext;
use crate::signature::{replay, validate_strokes, BitmapSignaturePad, Point, SignaturePad};
use crate::steps::Step;
use crate::vendors::{
    KycSession, KycStatus, LinkToken, SignatureSubmission, Vendors,
};

/// What the applicant submitted on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum StepInput {
    Terms {
        accepted: bool,
    },
    Kyc {
        session_id: String,
    },
    Bank {
        public_token: String,
        account_id: String,
    },
    Payment {
        method: PaymentMethod,
        #[serde(default)]
        autopay: bool,
    },
    Signing {
        signer_name: String,
        /// Pointer positions, one list per stroke.
        strokes: Vec<Vec<Point>>,
    },
}

impl StepInput {
    pub fn step(&self) -> Step {
        match self {
            Self::Terms { .. } => Step::Terms,
            Self::Kyc { .. } => Step::Kyc,
            Self::Bank { .. } => Step::Bank,
            Self::Payment { .. } => Step::Payment,
            Self::Signing { .. } => Step::Signing,
        }
    }
}

type PadFactory = Arc<dyn Fn() -> Box<dyn SignaturePad> + Send + Sync>;

/// Runs the step components against a set of vendor adapters.
#[derive(Clone)]
pub struct StepRunner {
    vendors: Vendors,
    new_pad: PadFactory,
}

impl StepRunner {
    pub fn new(vendors: Vendors) -> Self {
        Self {
            vendors,
            new_pad: Arc::new(|| -> Box<dyn SignaturePad> {
                Box::new(BitmapSignaturePad::default())
            }),
        }
    }

    /// Use a different signature pad for the `signing` step.
    pub fn with_pad_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SignaturePad> + Send + Sync + 'static,
    {
        self.new_pad = Arc::new(factory);
        self
    }

    pub fn vendors(&self) -> &Vendors {
        &self.vendors
    }

    /// Open an identity-verification session for the applicant.
    pub async fn start_kyc(&self, ctx: &ApplicationContext) -> Result<KycSession> {
        check_reference(ctx.contract_id)?;
        let session = self
            .vendors
            .kyc
            .create_session(ctx.contract_id, &ctx.applicant)
            .await?;
        info!(
            "KYC session {} opened for contract {}",
            session.session_id, ctx.contract_id
        );
        Ok(session)
    }

    /// Obtain a link token for the bank-connection widget.
    pub async fn start_bank_link(&self, ctx: &ApplicationContext) -> Result<LinkToken> {
        check_reference(ctx.contract_id)?;
        self.vendors
            .bank
            .create_link_token(ctx.contract_id, &ctx.applicant)
            .await
    }

    /// Produce the completion payload for `input`.
    pub async fn run(
        &self,
        ctx: &ApplicationContext,
        view: &ApplicationSnapshot,
        input: StepInput,
    ) -> Result<StepData> {
        check_reference(ctx.contract_id)?;
        if view.contract.id != ctx.contract_id {
            return Err(OriginationError::InvalidContractReference(ctx.contract_id));
        }

        let now = Utc::now();
        match input {
            StepInput::Terms { accepted } => {
                if !accepted {
                    return Err(OriginationError::Validation(
                        "the financing terms must be accepted".to_string(),
                    ));
                }
                Ok(StepData::Terms {
                    accepted,
                    accepted_at: now,
                    ip_address: ctx.ip_address.clone(),
                })
            }

            StepInput::Kyc { session_id } => {
                require("session_id", &session_id)?;
                let status = self.vendors.kyc.session_status(&session_id).await?;
                match status {
                    KycStatus::Approved => Ok(StepData::Kyc {
                        session_id,
                        status: status.as_str().to_string(),
                        verified_at: now,
                    }),
                    other => {
                        warn!(
                            "KYC session {session_id} for contract {} is {}",
                            ctx.contract_id,
                            other.as_str()
                        );
                        Err(OriginationError::Validation(format!(
                            "identity verification is {}",
                            other.as_str()
                        )))
                    }
                }
            }

            StepInput::Bank {
                public_token,
                account_id,
            } => {
                require("public_token", &public_token)?;
                require("account_id", &account_id)?;
                let linked = self
                    .vendors
                    .bank
                    .exchange_public_token(&public_token, &account_id)
                    .await?;
                Ok(StepData::Bank {
                    institution: linked.institution,
                    account_mask: linked.account_mask,
                    item_id: linked.item_id,
                    linked_at: now,
                })
            }

            StepInput::Payment { method, autopay } => {
                if method == PaymentMethod::Ach && !view.is_step_completed(Step::Bank) {
                    return Err(OriginationError::Validation(
                        "ACH payments need a linked bank account".to_string(),
                    ));
                }
                Ok(StepData::Payment {
                    method,
                    autopay,
                    confirmed_at: now,
                })
            }

            StepInput::Signing {
                signer_name,
                strokes,
            } => {
                require("signer_name", &signer_name)?;
                validate_strokes(&strokes)?;
                let signature_image = {
                    let mut pad = (self.new_pad)();
                    replay(pad.as_mut(), &strokes);
                    pad.export_image()?
                };

                let receipt = self
                    .vendors
                    .esign
                    .submit(&SignatureSubmission {
                        contract_id: ctx.contract_id,
                        contract_number: view.contract.contract_number.clone(),
                        signer_name: signer_name.clone(),
                        signature_image: signature_image.clone(),
                    })
                    .await?;
                Ok(StepData::Signing {
                    envelope_id: receipt.envelope_id,
                    signer_name,
                    signature_image,
                    signed_at: now,
                    ip_address: ctx.ip_address.clone(),
                })
            }
        }
    }
}

fn check_reference(contract_id: i64) -> Result<()> {
    if contract_id <= 0 {
        return Err(OriginationError::InvalidContractReference(contract_id));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OriginationError::Validation(format!("{field} is required")));
    }
    Ok(())
}
