//! Allocation decisions expressed as data.
//!
//! The planner reads a [`ClientPosition`] and returns a [`Plan`]: an
//! ordered list of [`Action`]s. Two interpreters run over the same plan.
//! [`Applier`] writes each action through a ledger transaction and
//! [`narrate`] renders each action as a sentence without writing anything.

pub mod apply;
pub mod narrate;
pub mod posting;
pub mod reversal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::payments::status::can_transition;
use crate::state::{ClientPosition, LoanPosition};
use crate::types::{ClientId, InstallmentId, LoanId, LoanStatus, OverpaymentReason, PaymentId};

pub use apply::Applier;
pub use narrate::{narrate, Intent, Simulation};
pub use posting::plan_posting;
pub use reversal::{ensure_editable, plan_amendment, plan_reversal, reversal_target};

/// which arm of the decision tree a plan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    /// payer could not be matched to a client; recorded only
    Unattributed,
    NoActiveLoan,
    /// fee not covered; payment parked as standing credit
    FeeShortfall,
    Allocated,
    Reversal,
    Amendment,
    /// redelivery of a reference already on file
    Duplicate,
}

/// reason a reversal cannot go ahead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Blocker {
    /// credit the payment left behind has since been spent
    InsufficientCredit {
        client_id: ClientId,
        available: Money,
        required: Money,
    },
    /// the loan would need to reopen while another loan is active
    ReactivationBlocked {
        loan_id: LoanId,
        active_loan_id: LoanId,
    },
}

impl Blocker {
    pub fn to_error(&self) -> EngineError {
        match *self {
            Blocker::InsufficientCredit {
                available, required, ..
            } => EngineError::InsufficientOverpayment {
                available,
                requested: required,
            },
            Blocker::ReactivationBlocked {
                loan_id,
                active_loan_id,
            } => EngineError::ReactivationBlocked {
                loan_id,
                active_loan_id,
            },
        }
    }
}

/// one intended change to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    DebitOverpayment {
        client_id: ClientId,
        amount: Money,
        reason: OverpaymentReason,
    },
    CreditOverpayment {
        client_id: ClientId,
        amount: Money,
        reason: OverpaymentReason,
    },
    SettleFee {
        loan_id: LoanId,
        amount: Money,
    },
    SettleInstallment {
        loan_id: LoanId,
        installment_id: InstallmentId,
        sequence: u32,
        amount: Money,
        fully_paid: bool,
    },
    CompleteLoan {
        loan_id: LoanId,
    },
    RevertInstallment {
        loan_id: LoanId,
        installment_id: InstallmentId,
        sequence: u32,
        amount: Money,
    },
    RevertFee {
        loan_id: LoanId,
        amount: Money,
    },
    ReopenLoan {
        loan_id: LoanId,
    },
    /// carry on against the client's active loan once the reverted one is settled with
    SwitchLoan {
        from: LoanId,
        to: LoanId,
    },
    Blocked(Blocker),
    VoidAllocations {
        payment_id: PaymentId,
        lines: usize,
    },
    VoidPayment {
        payment_id: PaymentId,
    },
    ChangeAmount {
        payment_id: PaymentId,
        from: Money,
        to: Money,
    },
}

impl Action {
    /// name used for deadline and cancellation checks
    pub fn step(&self) -> &'static str {
        match self {
            Action::DebitOverpayment { .. } => "debit overpayment",
            Action::CreditOverpayment { .. } => "credit overpayment",
            Action::SettleFee { .. } => "settle processing fee",
            Action::SettleInstallment { .. } => "settle installment",
            Action::CompleteLoan { .. } => "complete loan",
            Action::RevertInstallment { .. } => "revert installment",
            Action::RevertFee { .. } => "revert processing fee",
            Action::ReopenLoan { .. } => "reopen loan",
            Action::SwitchLoan { .. } => "switch loan",
            Action::Blocked(_) => "blocked",
            Action::VoidAllocations { .. } => "void allocations",
            Action::VoidPayment { .. } => "void payment",
            Action::ChangeAmount { .. } => "change amount",
        }
    }

    /// actions that only touch the payment record need no client position
    pub fn touches_position(&self) -> bool {
        !matches!(
            self,
            Action::VoidAllocations { .. } | Action::VoidPayment { .. } | Action::ChangeAmount { .. }
        )
    }

    /// apply this action to an in-memory position
    ///
    /// Both interpreters go through here, so the applier persists exactly
    /// the state the narrator describes.
    pub fn apply_to(&self, position: &mut ClientPosition, at: DateTime<Utc>) -> Result<()> {
        match *self {
            Action::DebitOverpayment { amount, .. } => {
                if position.overpayment < amount {
                    return Err(EngineError::InsufficientOverpayment {
                        available: position.overpayment,
                        requested: amount,
                    });
                }
                position.overpayment -= amount;
            }
            Action::CreditOverpayment { amount, .. } => {
                position.overpayment += amount;
            }
            Action::SettleFee { loan_id, amount } => {
                let lp = loan_for(position, loan_id)?;
                if lp.loan.fee_paid || amount != lp.loan.processing_fee {
                    return Err(EngineError::invariant(format!(
                        "processing fee of loan {} cannot be settled with {}",
                        loan_id, amount
                    )));
                }
                lp.loan.fee_paid = true;
            }
            Action::SettleInstallment {
                loan_id,
                installment_id,
                amount,
                fully_paid,
                ..
            } => {
                let lp = loan_for(position, loan_id)?;
                let installment = lp.installment_mut(installment_id)?;
                installment.settle(amount, at)?;
                if installment.paid != fully_paid {
                    return Err(EngineError::invariant(format!(
                        "installment #{} settlement disagrees with plan",
                        installment.sequence
                    )));
                }
                lp.loan.paid_amount += amount;
            }
            Action::CompleteLoan { loan_id } => {
                let lp = loan_for(position, loan_id)?;
                if lp.unpaid().next().is_some() {
                    return Err(EngineError::invariant(format!(
                        "loan {} still has unpaid installments",
                        loan_id
                    )));
                }
                transition(lp, LoanStatus::Completed)?;
            }
            Action::RevertInstallment {
                loan_id,
                installment_id,
                amount,
                ..
            } => {
                let lp = loan_for(position, loan_id)?;
                lp.installment_mut(installment_id)?.revert(amount)?;
                lp.loan.paid_amount -= amount;
                if lp.loan.paid_amount.is_negative() {
                    return Err(EngineError::invariant(format!(
                        "loan {} paid amount would go negative",
                        loan_id
                    )));
                }
            }
            Action::RevertFee { loan_id, .. } => {
                let lp = loan_for(position, loan_id)?;
                if !lp.loan.fee_paid {
                    return Err(EngineError::invariant(format!(
                        "processing fee of loan {} is not marked paid",
                        loan_id
                    )));
                }
                lp.loan.fee_paid = false;
            }
            Action::ReopenLoan { loan_id } => {
                let lp = loan_for(position, loan_id)?;
                if let Some(active_loan_id) = lp.other_active_loan {
                    return Err(EngineError::ReactivationBlocked {
                        loan_id,
                        active_loan_id,
                    });
                }
                transition(lp, LoanStatus::Active)?;
            }
            Action::SwitchLoan { from, to } => {
                if loan_for(position, from)?.loan.status == LoanStatus::Active {
                    return Err(EngineError::invariant(format!(
                        "loan {} is still active and keeps its payments",
                        from
                    )));
                }
                match position.active_loan.take() {
                    Some(next) if next.loan.id == to && next.loan.status == LoanStatus::Active => {
                        position.loan = Some(next);
                    }
                    other => {
                        position.active_loan = other;
                        return Err(EngineError::invariant(format!(
                            "loan {} is not the client's loaded active loan",
                            to
                        )));
                    }
                }
            }
            Action::Blocked(blocker) => return Err(blocker.to_error()),
            Action::VoidAllocations { .. } | Action::VoidPayment { .. } | Action::ChangeAmount { .. } => {}
        }
        Ok(())
    }
}

fn loan_for(position: &mut ClientPosition, loan_id: LoanId) -> Result<&mut LoanPosition> {
    match position.loan.as_mut() {
        Some(lp) if lp.loan.id == loan_id => Ok(lp),
        _ => Err(EngineError::invariant(format!(
            "loan {} is not part of the loaded position",
            loan_id
        ))),
    }
}

fn transition(lp: &mut LoanPosition, to: LoanStatus) -> Result<()> {
    if !can_transition(lp.loan.status, to) {
        return Err(EngineError::invariant(format!(
            "loan {} cannot move from {:?} to {:?}",
            lp.loan.id, lp.loan.status, to
        )));
    }
    lp.loan.status = to;
    Ok(())
}

/// ordered actions plus the branch that produced them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub branch: Branch,
    pub client_id: Option<ClientId>,
    /// loan the plan settles against, if any
    pub loan_id: Option<LoanId>,
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn unattributed() -> Self {
        Self {
            branch: Branch::Unattributed,
            client_id: None,
            loan_id: None,
            actions: Vec::new(),
        }
    }

    pub fn blockers(&self) -> impl Iterator<Item = &Blocker> {
        self.actions.iter().filter_map(|a| match a {
            Action::Blocked(blocker) => Some(blocker),
            _ => None,
        })
    }

    pub fn is_blocked(&self) -> bool {
        self.blockers().next().is_some()
    }

    /// run every action against a copy of the position
    pub fn project(&self, position: &ClientPosition, at: DateTime<Utc>) -> Result<ClientPosition> {
        let mut scratch = position.clone();
        for action in &self.actions {
            action.apply_to(&mut scratch, at)?;
        }
        Ok(scratch)
    }

    /// total moved onto installments
    pub fn installment_total(&self) -> Money {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::SettleInstallment { amount, .. } => Some(*amount),
                _ => None,
            })
            .sum()
    }
}
