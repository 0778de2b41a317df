//! # Steps
//!
//! The fixed origination sequence and the state machine that walks it.
//!
//! ```text
//! terms ──AcceptTerms──► kyc ──VerifyIdentity──► bank ──LinkBankAccount──►
//! payment ──ConfirmPayment──► signing ──SignContract──► completed
//! ```
//!
//! Every edge leaves exactly one state. [`CurrentStep::apply`] rejects an edge
//! that does not leave the current state, so `signing` is unreachable until
//! `kyc`, `bank` and `payment` have been passed in order. `completed` is
//! terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{OriginationError, Result};

/// One stage of the origination sequence. Stored as the `step` of a
/// progress row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Step {
    Terms,
    Kyc,
    Bank,
    Payment,
    Signing,
}

/// Steps in the order an applicant must complete them.
pub const STEP_SEQUENCE: [Step; 5] = [
    Step::Terms,
    Step::Kyc,
    Step::Bank,
    Step::Payment,
    Step::Signing,
];

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terms => "terms",
            Self::Kyc => "kyc",
            Self::Bank => "bank",
            Self::Payment => "payment",
            Self::Signing => "signing",
        }
    }

    /// Zero-based position in [`STEP_SEQUENCE`].
    pub fn position(&self) -> usize {
        match self {
            Self::Terms => 0,
            Self::Kyc => 1,
            Self::Bank => 2,
            Self::Payment => 3,
            Self::Signing => 4,
        }
    }

    /// The state reached once this step is completed.
    pub fn next(&self) -> CurrentStep {
        STEP_SEQUENCE
            .get(self.position() + 1)
            .map(|s| CurrentStep::from(*s))
            .unwrap_or(CurrentStep::Completed)
    }

    /// Steps that must be complete before this one may be.
    pub fn predecessors(&self) -> &'static [Step] {
        &STEP_SEQUENCE[..self.position()]
    }

    /// The named edge that completes this step.
    pub fn completion_edge(&self) -> Transition {
        match self {
            Self::Terms => Transition::AcceptTerms,
            Self::Kyc => Transition::VerifyIdentity,
            Self::Bank => Transition::LinkBankAccount,
            Self::Payment => Transition::ConfirmPayment,
            Self::Signing => Transition::SignContract,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = OriginationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "terms" => Ok(Self::Terms),
            "kyc" => Ok(Self::Kyc),
            "bank" => Ok(Self::Bank),
            "payment" => Ok(Self::Payment),
            "signing" => Ok(Self::Signing),
            other => Err(OriginationError::InvalidStep(other.to_string())),
        }
    }
}

/// Where an application currently stands: one of the five steps, or the
/// terminal `completed` marker. Stored on the contract's `current_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CurrentStep {
    Terms,
    Kyc,
    Bank,
    Payment,
    Signing,
    Completed,
}

impl CurrentStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            other => other.step().map(|s| s.as_str()).unwrap_or("completed"),
        }
    }

    /// The pending step, or `None` once the sequence is finished.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Terms => Some(Step::Terms),
            Self::Kyc => Some(Step::Kyc),
            Self::Bank => Some(Step::Bank),
            Self::Payment => Some(Step::Payment),
            Self::Signing => Some(Step::Signing),
            Self::Completed => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Follow `edge` out of this state.
    pub fn apply(self, edge: Transition) -> Result<CurrentStep> {
        match self.step() {
            Some(step) if step == edge.from() => Ok(edge.to()),
            _ => Err(OriginationError::illegal(self, edge.to())),
        }
    }
}

impl From<Step> for CurrentStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Terms => Self::Terms,
            Step::Kyc => Self::Kyc,
            Step::Bank => Self::Bank,
            Step::Payment => Self::Payment,
            Step::Signing => Self::Signing,
        }
    }
}

impl fmt::Display for CurrentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrentStep {
    type Err = OriginationError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "completed" {
            return Ok(Self::Completed);
        }
        s.parse::<Step>().map(Self::from)
    }
}

/// Named edges of the application state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    AcceptTerms,
    VerifyIdentity,
    LinkBankAccount,
    ConfirmPayment,
    SignContract,
}

impl Transition {
    pub fn from(&self) -> Step {
        match self {
            Self::AcceptTerms => Step::Terms,
            Self::VerifyIdentity => Step::Kyc,
            Self::LinkBankAccount => Step::Bank,
            Self::ConfirmPayment => Step::Payment,
            Self::SignContract => Step::Signing,
        }
    }

    pub fn to(&self) -> CurrentStep {
        self.from().next()
    }
}

/// Return the identifier that follows `identifier`, or `completed` after the
/// last step. Unknown identifiers are rejected.
pub fn next_step(identifier: &str) -> Result<CurrentStep> {
    Ok(identifier.parse::<Step>()?.next())
}

/// Derive the current state from `(step, completed)` pairs: the first step in
/// sequence whose row is missing or incomplete, or `completed` when none is.
pub fn derive_current_step<I>(rows: I) -> CurrentStep
where
    I: IntoIterator<Item = (Step, bool)>,
{
    let mut done = [false; STEP_SEQUENCE.len()];
    for (step, completed) in rows {
        if completed {
            done[step.position()] = true;
        }
    }
    STEP_SEQUENCE
        .iter()
        .find(|s| !done[s.position()])
        .map(|s| CurrentStep::from(*s))
        .unwrap_or(CurrentStep::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_step_follows_sequence() {
        assert_eq!(next_step("terms").unwrap(), CurrentStep::Kyc);
        assert_eq!(next_step("kyc").unwrap(), CurrentStep::Bank);
        assert_eq!(next_step("bank").unwrap(), CurrentStep::Payment);
        assert_eq!(next_step("payment").unwrap(), CurrentStep::Signing);
    }

    #[test]
    fn next_step_after_signing_is_completed() {
        assert_eq!(next_step("signing").unwrap(), CurrentStep::Completed);
    }

    #[test]
    fn next_step_rejects_unknown_identifier() {
        match next_step("shipping") {
            Err(OriginationError::InvalidStep(s)) => assert_eq!(s, "shipping"),
            other => panic!("expected InvalidStep, got {other:?}"),
        }
        // The terminal marker is not a step either.
        assert!(next_step("completed").is_err());
    }

    #[test]
    fn no_rows_starts_at_terms() {
        assert_eq!(derive_current_step(Vec::new()), CurrentStep::Terms);
    }

    #[test]
    fn first_missing_row_is_current() {
        for k in 0..STEP_SEQUENCE.len() {
            let rows: Vec<_> = STEP_SEQUENCE[..k].iter().map(|s| (*s, true)).collect();
            assert_eq!(derive_current_step(rows), CurrentStep::from(STEP_SEQUENCE[k]));
        }
    }

    #[test]
    fn incomplete_row_is_current_even_if_later_rows_are_done() {
        let rows = vec![
            (Step::Terms, true),
            (Step::Kyc, false),
            (Step::Bank, true),
        ];
        assert_eq!(derive_current_step(rows), CurrentStep::Kyc);
    }

    #[test]
    fn all_rows_complete_is_completed() {
        let rows: Vec<_> = STEP_SEQUENCE.iter().map(|s| (*s, true)).collect();
        assert_eq!(derive_current_step(rows), CurrentStep::Completed);
    }

    #[test]
    fn state_machine_walks_in_order() {
        let mut state = CurrentStep::Terms;
        for step in STEP_SEQUENCE {
            state = state.apply(step.completion_edge()).unwrap();
        }
        assert_eq!(state, CurrentStep::Completed);
    }

    #[test]
    fn state_machine_rejects_skipping_ahead() {
        let err = CurrentStep::Terms
            .apply(Transition::SignContract)
            .unwrap_err();
        match err {
            OriginationError::IllegalTransition { from, to } => {
                assert_eq!(from, "terms");
                assert_eq!(to, "completed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn completed_is_terminal() {
        assert!(CurrentStep::Completed
            .apply(Transition::AcceptTerms)
            .is_err());
    }

    #[test]
    fn current_step_round_trips_through_strings() {
        for s in ["terms", "kyc", "bank", "payment", "signing", "completed"] {
            assert_eq!(s.parse::<CurrentStep>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn predecessors_of_signing() {
        assert_eq!(
            Step::Signing.predecessors(),
            &[Step::Terms, Step::Kyc, Step::Bank, Step::Payment]
        );
        assert!(Step::Terms.predecessors().is_empty());
    }
}
