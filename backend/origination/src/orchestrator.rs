//! Client orchestrator: works out where an application stands and drives
//! it forward one step at a time.
//!
//! The orchestrator talks to persistence through [`ProgressBackend`], which
//! mirrors the REST surface: one read plus four primitive writes. The
//! provided [`ProgressBackend::commit_step`] strings those writes together
//! as a saga and undoes the earlier ones when a later one fails; backends
//! that can commit atomically ([`SqliteStore`], the HTTP
//! [`ApiClient`](crate::client::ApiClient)) override it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::components::{StepInput, StepRunner};
use crate::db;
use crate::errors::{OriginationError, Result};
use crate::models::{
    ApplicationProgress, ApplicationSnapshot, CommitOutcome, Contract, ContractStatus,
    ProgressPatch, StepData,
};
use crate::steps::{CurrentStep, Step};
use crate::vendors::{ApplicantProfile, KycSession, LinkToken};

/// What the orchestrator shows for one application.
pub type ApplicationView = ApplicationSnapshot;

/// Everything about the applicant's session that steps may need. Passed
/// explicitly instead of being read from ambient storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationContext {
    pub contract_id: i64,
    pub applicant: ApplicantProfile,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait ProgressBackend: Send + Sync {
    /// `GET contract(id)`: contract plus its progress rows.
    async fn load_application(&self, contract_id: i64) -> Result<ApplicationSnapshot>;

    /// Lazily create the row for `step`.
    async fn ensure_progress(&self, contract_id: i64, step: Step) -> Result<ApplicationProgress>;

    /// `PATCH applicationProgress(id) { completed, data }`
    async fn patch_progress(
        &self,
        progress_id: i64,
        patch: &ProgressPatch,
    ) -> Result<ApplicationProgress>;

    /// `PATCH contract(id).step { step }`
    async fn patch_contract_step(&self, contract_id: i64, step: CurrentStep) -> Result<Contract>;

    /// `PATCH contract(id).status { status }`
    async fn patch_contract_status(
        &self,
        contract_id: i64,
        status: ContractStatus,
    ) -> Result<Contract>;

    /// Complete `step` and advance the contract.
    ///
    /// Issues the primitive writes in order: progress row, contract step,
    /// then status after the last step. If a contract write fails, the
    /// progress row (and the contract step, if it moved) are restored and
    /// [`OriginationError::PartialStepCommit`] is returned.
    async fn commit_step(
        &self,
        contract_id: i64,
        step: Step,
        data: StepData,
    ) -> Result<CommitOutcome> {
        data.ensure_step(step)?;
        let snapshot = self.load_application(contract_id).await?;
        if let Some(done) = snapshot.row(step).filter(|r| r.completed) {
            return Ok(CommitOutcome {
                contract: snapshot.contract.clone(),
                progress: done.clone(),
                already_completed: true,
            });
        }
        snapshot.contract.ensure_open()?;
        let next = snapshot.current_step.apply(step.completion_edge())?;

        let row = match snapshot.row(step) {
            Some(row) => row.clone(),
            None => self.ensure_progress(contract_id, step).await?,
        };
        let progress = self
            .patch_progress(
                row.id,
                &ProgressPatch {
                    completed: true,
                    data: Some(data),
                },
            )
            .await?;

        let prior_step = snapshot.contract.current_step;
        let mut step_moved = false;
        let advanced = match self.patch_contract_step(contract_id, next).await {
            Ok(contract) => {
                step_moved = contract.current_step != prior_step;
                if next.is_completed() && contract.status == ContractStatus::Pending {
                    self.patch_contract_status(contract_id, ContractStatus::Active)
                        .await
                } else {
                    Ok(contract)
                }
            }
            Err(e) => Err(e),
        };

        match advanced {
            Ok(contract) => Ok(CommitOutcome {
                contract,
                progress,
                already_completed: false,
            }),
            Err(err) => {
                warn!("Contract {contract_id}: {step} written but contract update failed: {err}");
                let mut rolled_back = self
                    .patch_progress(
                        row.id,
                        &ProgressPatch {
                            completed: false,
                            data: None,
                        },
                    )
                    .await
                    .map_err(|e| warn!("Compensation of {step} progress failed: {e}"))
                    .is_ok();
                if rolled_back && step_moved {
                    rolled_back = self
                        .patch_contract_step(contract_id, prior_step)
                        .await
                        .map_err(|e| warn!("Compensation of contract step failed: {e}"))
                        .is_ok();
                }
                Err(OriginationError::PartialStepCommit {
                    step,
                    rolled_back,
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// [`ProgressBackend`] directly over the SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressBackend for SqliteStore {
    async fn load_application(&self, contract_id: i64) -> Result<ApplicationSnapshot> {
        db::load_application(&self.pool, contract_id).await
    }

    async fn ensure_progress(&self, contract_id: i64, step: Step) -> Result<ApplicationProgress> {
        db::ensure_progress(&self.pool, contract_id, step).await
    }

    async fn patch_progress(
        &self,
        progress_id: i64,
        patch: &ProgressPatch,
    ) -> Result<ApplicationProgress> {
        db::patch_progress(&self.pool, progress_id, patch).await
    }

    async fn patch_contract_step(&self, contract_id: i64, step: CurrentStep) -> Result<Contract> {
        db::update_contract_step(&self.pool, contract_id, step).await
    }

    async fn patch_contract_status(
        &self,
        contract_id: i64,
        status: ContractStatus,
    ) -> Result<Contract> {
        db::update_contract_status(&self.pool, contract_id, status).await
    }

    async fn commit_step(
        &self,
        contract_id: i64,
        step: Step,
        data: StepData,
    ) -> Result<CommitOutcome> {
        db::commit_step(&self.pool, contract_id, step, &data).await
    }
}

pub struct Orchestrator<B> {
    backend: B,
    runner: StepRunner,
}

impl<B: ProgressBackend> Orchestrator<B> {
    pub fn new(backend: B, runner: StepRunner) -> Self {
        Self { backend, runner }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fetch the contract and its progress. Call again to retry after a
    /// read failure.
    pub async fn load(&self, contract_id: i64) -> Result<ApplicationView> {
        if contract_id <= 0 {
            return Err(OriginationError::InvalidContractReference(contract_id));
        }
        let view = self.backend.load_application(contract_id).await?;
        debug!(
            "Contract {contract_id} loaded at step {} ({} progress rows)",
            view.current_step,
            view.progress.len()
        );
        Ok(view)
    }

    /// Load the application and make sure the current step has a progress
    /// row, as happens on the first visit to a step.
    pub async fn visit(&self, ctx: &ApplicationContext) -> Result<ApplicationView> {
        let view = self.load(ctx.contract_id).await?;
        match view.current_step.step() {
            Some(step) if view.row(step).is_none() => {
                self.backend.ensure_progress(ctx.contract_id, step).await?;
                self.load(ctx.contract_id).await
            }
            _ => Ok(view),
        }
    }

    pub async fn start_kyc(&self, ctx: &ApplicationContext) -> Result<KycSession> {
        self.runner.start_kyc(ctx).await
    }

    pub async fn start_bank_link(&self, ctx: &ApplicationContext) -> Result<LinkToken> {
        self.runner.start_bank_link(ctx).await
    }

    /// Run the step component for `input` and commit its result.
    ///
    /// Returns the new current step. Nothing advances unless the commit
    /// succeeded. Submitting a step that is already complete is a no-op.
    pub async fn submit(&self, ctx: &ApplicationContext, input: StepInput) -> Result<CurrentStep> {
        let view = self.load(ctx.contract_id).await?;
        let step = input.step();
        if view.is_step_completed(step) {
            debug!("Contract {}: {step} already completed", ctx.contract_id);
            return Ok(view.current_step);
        }
        view.current_step.apply(step.completion_edge())?;

        let data = self.runner.run(ctx, &view, input).await?;
        let outcome = self.backend.commit_step(ctx.contract_id, step, data).await?;
        let current = outcome.contract.current_step;

        if !outcome.already_completed
            && current.is_completed()
            && outcome.contract.status == ContractStatus::Active
        {
            info!("Contract {} is now active", ctx.contract_id);
            self.notify_activation(ctx, &outcome.contract).await;
        }
        Ok(current)
    }

    async fn notify_activation(&self, ctx: &ApplicationContext, contract: &Contract) {
        let notifier = &self.runner.vendors().notifier;
        let number = contract.contract_number.as_deref().unwrap_or("your contract");
        let body = format!(
            "Hi {}, {number} is signed and active. Your first payment of ${:.2} is due in one month.",
            ctx.applicant.first_name, contract.monthly_payment
        );

        if !ctx.applicant.email.is_empty() {
            if let Err(e) = notifier
                .send_email(&ctx.applicant.email, "Your financing is active", &body)
                .await
            {
                warn!("Activation email for contract {} failed: {e}", contract.id);
            }
        }
        if let Some(phone) = &ctx.applicant.phone {
            if let Err(e) = notifier.send_sms(phone, &body).await {
                warn!("Activation SMS for contract {} failed: {e}", contract.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::tests::{context, fixture_vendors, signature_strokes};
    use crate::db::tests::{memory_pool, sample_data, scenario_offer};
    use crate::models::PaymentMethod;
    use crate::steps::STEP_SEQUENCE;
    use crate::vendors::Notifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn inputs() -> Vec<StepInput> {
        vec![
            StepInput::Terms { accepted: true },
            StepInput::Kyc {
                session_id: "sess-ok".into(),
            },
            StepInput::Bank {
                public_token: "public-ok".into(),
                account_id: "acc-1".into(),
            },
            StepInput::Payment {
                method: PaymentMethod::Ach,
                autopay: true,
            },
            StepInput::Signing {
                signer_name: "Ada Lovelace".into(),
                strokes: signature_strokes(),
            },
        ]
    }

    #[derive(Default)]
    struct CountingNotifier {
        emails: AtomicUsize,
        sms: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send_email(&self, _to: &str, _subject: &str, _body: &str) -> Result<()> {
            self.emails.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_sms(&self, _to: &str, _body: &str) -> Result<()> {
            self.sms.fetch_add(1, Ordering::SeqCst);
            Err(OriginationError::vendor("notify", "sms gateway down"))
        }
    }

    #[tokio::test]
    async fn full_walk_through_activates_and_notifies() {
        let pool = memory_pool().await;
        let contract = db::insert_contract(&pool, &scenario_offer()).await.unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let mut vendors = fixture_vendors();
        vendors.notifier = notifier.clone();
        let orch = Orchestrator::new(SqliteStore::new(pool.clone()), StepRunner::new(vendors));
        let ctx = context(contract.id);

        assert_eq!(orch.load(contract.id).await.unwrap().current_step, CurrentStep::Terms);

        let mut current = CurrentStep::Terms;
        for (input, step) in inputs().into_iter().zip(STEP_SEQUENCE) {
            let view = orch.visit(&ctx).await.unwrap();
            assert_eq!(view.current_step, CurrentStep::from(step));
            assert_ne!(view.progress_id(step), 0);
            current = orch.submit(&ctx, input).await.unwrap();
            assert_eq!(current, step.next());
        }
        assert_eq!(current, CurrentStep::Completed);

        let view = orch.load(contract.id).await.unwrap();
        assert_eq!(view.contract.status, ContractStatus::Active);
        assert_eq!(view.contract.current_step, CurrentStep::Completed);
        assert_eq!(notifier.emails.load(Ordering::SeqCst), 1);
        // SMS failure is logged, not fatal.
        assert_eq!(notifier.sms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubmitting_a_completed_step_keeps_position() {
        let pool = memory_pool().await;
        let contract = db::insert_contract(&pool, &scenario_offer()).await.unwrap();
        let orch = Orchestrator::new(
            SqliteStore::new(pool),
            StepRunner::new(fixture_vendors()),
        );
        let ctx = context(contract.id);
        let steps = inputs();

        orch.submit(&ctx, steps[0].clone()).await.unwrap();
        orch.submit(&ctx, steps[1].clone()).await.unwrap();
        let again = orch.submit(&ctx, steps[0].clone()).await.unwrap();
        assert_eq!(again, CurrentStep::Bank);
    }

    #[tokio::test]
    async fn skipping_ahead_is_rejected_before_vendor_calls() {
        let pool = memory_pool().await;
        let contract = db::insert_contract(&pool, &scenario_offer()).await.unwrap();
        let orch = Orchestrator::new(
            SqliteStore::new(pool),
            StepRunner::new(fixture_vendors()),
        );
        let err = orch
            .submit(&context(contract.id), inputs().remove(4))
            .await
            .unwrap_err();
        assert!(matches!(err, OriginationError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_contract_is_not_found() {
        let pool = memory_pool().await;
        let orch = Orchestrator::new(
            SqliteStore::new(pool),
            StepRunner::new(fixture_vendors()),
        );
        assert!(matches!(
            orch.load(42).await,
            Err(OriginationError::ContractNotFound(_))
        ));
        assert!(matches!(
            orch.load(0).await,
            Err(OriginationError::InvalidContractReference(0))
        ));
    }

    #[tokio::test]
    async fn vendor_failure_does_not_advance() {
        let pool = memory_pool().await;
        let contract = db::insert_contract(&pool, &scenario_offer()).await.unwrap();
        let orch = Orchestrator::new(
            SqliteStore::new(pool),
            StepRunner::new(fixture_vendors()),
        );
        let ctx = context(contract.id);
        orch.submit(&ctx, StepInput::Terms { accepted: true }).await.unwrap();
        orch.submit(
            &ctx,
            StepInput::Kyc {
                session_id: "sess-ok".into(),
            },
        )
        .await
        .unwrap();

        let err = orch
            .submit(
                &ctx,
                StepInput::Bank {
                    public_token: "public-expired".into(),
                    account_id: "acc-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OriginationError::Vendor { .. }));
        assert_eq!(orch.load(contract.id).await.unwrap().current_step, CurrentStep::Bank);
    }

    // ── Saga over the primitive writes ──────────────────────

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        None,
        ContractStep,
        ContractStatus,
        ContractStatusAndCompensation,
    }

    /// Store-backed backend that only exposes the primitive calls (so the
    /// provided saga `commit_step` is used) and can fail on demand.
    struct FlakyBackend {
        store: SqliteStore,
        fault: Mutex<Fault>,
    }

    impl FlakyBackend {
        fn fault(&self) -> Fault {
            *self.fault.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProgressBackend for FlakyBackend {
        async fn load_application(&self, contract_id: i64) -> Result<ApplicationSnapshot> {
            self.store.load_application(contract_id).await
        }

        async fn ensure_progress(
            &self,
            contract_id: i64,
            step: Step,
        ) -> Result<ApplicationProgress> {
            self.store.ensure_progress(contract_id, step).await
        }

        async fn patch_progress(
            &self,
            progress_id: i64,
            patch: &ProgressPatch,
        ) -> Result<ApplicationProgress> {
            if !patch.completed && self.fault() == Fault::ContractStatusAndCompensation {
                return Err(OriginationError::vendor("api", "connection reset"));
            }
            self.store.patch_progress(progress_id, patch).await
        }

        async fn patch_contract_step(
            &self,
            contract_id: i64,
            step: CurrentStep,
        ) -> Result<Contract> {
            if self.fault() == Fault::ContractStep {
                return Err(OriginationError::vendor("api", "502 Bad Gateway"));
            }
            self.store.patch_contract_step(contract_id, step).await
        }

        async fn patch_contract_status(
            &self,
            contract_id: i64,
            status: ContractStatus,
        ) -> Result<Contract> {
            if matches!(
                self.fault(),
                Fault::ContractStatus | Fault::ContractStatusAndCompensation
            ) {
                return Err(OriginationError::vendor("api", "502 Bad Gateway"));
            }
            self.store.patch_contract_status(contract_id, status).await
        }
    }

    async fn flaky(fault: Fault) -> (FlakyBackend, i64) {
        let pool = memory_pool().await;
        let contract = db::insert_contract(&pool, &scenario_offer()).await.unwrap();
        (
            FlakyBackend {
                store: SqliteStore::new(pool),
                fault: Mutex::new(fault),
            },
            contract.id,
        )
    }

    #[tokio::test]
    async fn saga_commits_through_primitive_calls() {
        let (backend, id) = flaky(Fault::None).await;
        for step in STEP_SEQUENCE {
            backend.commit_step(id, step, sample_data(step)).await.unwrap();
        }
        let snap = backend.load_application(id).await.unwrap();
        assert_eq!(snap.contract.status, ContractStatus::Active);
        assert_eq!(snap.contract.current_step, CurrentStep::Completed);

        let again = backend
            .commit_step(id, Step::Signing, sample_data(Step::Signing))
            .await
            .unwrap();
        assert!(again.already_completed);
        assert_eq!(again.contract.current_step, CurrentStep::Completed);
    }

    #[tokio::test]
    async fn saga_refuses_a_declined_contract() {
        let (backend, id) = flaky(Fault::None).await;
        backend
            .patch_contract_status(id, ContractStatus::Declined)
            .await
            .unwrap();
        let err = backend
            .commit_step(id, Step::Terms, sample_data(Step::Terms))
            .await
            .unwrap_err();
        assert!(matches!(err, OriginationError::Validation(_)));
        assert!(backend.load_application(id).await.unwrap().progress.is_empty());
    }

    #[tokio::test]
    async fn failed_contract_step_write_is_rolled_back() {
        let (backend, id) = flaky(Fault::ContractStep).await;
        let err = backend
            .commit_step(id, Step::Terms, sample_data(Step::Terms))
            .await
            .unwrap_err();
        match err {
            OriginationError::PartialStepCommit {
                step, rolled_back, ..
            } => {
                assert_eq!(step, Step::Terms);
                assert!(rolled_back);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let snap = backend.load_application(id).await.unwrap();
        assert!(!snap.is_step_completed(Step::Terms));
        assert_eq!(snap.current_step, CurrentStep::Terms);
        assert_eq!(snap.contract.current_step, CurrentStep::Terms);
    }

    #[tokio::test]
    async fn failed_activation_restores_signing() {
        let (backend, id) = flaky(Fault::None).await;
        for step in &STEP_SEQUENCE[..4] {
            backend.commit_step(id, *step, sample_data(*step)).await.unwrap();
        }
        *backend.fault.lock().unwrap() = Fault::ContractStatus;

        let err = backend
            .commit_step(id, Step::Signing, sample_data(Step::Signing))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let snap = backend.load_application(id).await.unwrap();
        assert_eq!(snap.current_step, CurrentStep::Signing);
        assert_eq!(snap.contract.current_step, CurrentStep::Signing);
        assert_eq!(snap.contract.status, ContractStatus::Pending);
    }

    #[tokio::test]
    async fn failed_compensation_reports_divergence() {
        let (backend, id) = flaky(Fault::None).await;
        for step in &STEP_SEQUENCE[..4] {
            backend.commit_step(id, *step, sample_data(*step)).await.unwrap();
        }
        *backend.fault.lock().unwrap() = Fault::ContractStatusAndCompensation;

        let err = backend
            .commit_step(id, Step::Signing, sample_data(Step::Signing))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OriginationError::PartialStepCommit {
                rolled_back: false,
                ..
            }
        ));
        assert!(!err.is_retryable());
    }
}
