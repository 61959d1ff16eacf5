use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::state::ClientPosition;
use crate::types::{ClientId, LoanId, OverpaymentReason};

use super::{Action, Blocker, Branch, Plan};

/// one planned action with a sentence describing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: Action,
    pub summary: String,
}

/// result of a dry run; nothing was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub branch: Branch,
    pub client_id: Option<ClientId>,
    pub loan_id: Option<LoanId>,
    pub intents: Vec<Intent>,
    /// the real edit would be refused
    pub blocked: bool,
}

impl Simulation {
    pub fn actions(&self) -> Vec<Action> {
        self.intents.iter().map(|i| i.action.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<&str> {
        self.intents.iter().map(|i| i.summary.as_str()).collect()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Store {
            step: "serialize simulation",
            message: e.to_string(),
        })
    }
}

/// describe a plan step by step without touching the store
///
/// Walks a copy of the position alongside the plan so balances in the
/// sentences are the ones each step would leave behind.
pub fn narrate(plan: &Plan, position: Option<&ClientPosition>, at: DateTime<Utc>) -> Simulation {
    let mut scratch = position.cloned();
    let mut intents = Vec::with_capacity(plan.actions.len());
    let mut failed = false;

    for action in &plan.actions {
        let before = scratch.clone();
        let applied = match scratch.as_mut() {
            Some(current) if action.touches_position() => action.apply_to(current, at),
            _ => Ok(()),
        };
        let summary = match applied {
            Ok(()) => describe(action, before.as_ref(), scratch.as_ref()),
            Err(err) => {
                // failed steps leave the position as it was
                scratch = before.clone();
                if matches!(action, Action::Blocked(_)) {
                    describe(action, before.as_ref(), scratch.as_ref())
                } else {
                    failed = true;
                    format!("would fail to {}: {}", action.step(), err)
                }
            }
        };
        intents.push(Intent {
            action: action.clone(),
            summary,
        });
    }

    Simulation {
        branch: plan.branch,
        client_id: plan.client_id,
        loan_id: plan.loan_id,
        intents,
        blocked: failed || plan.is_blocked(),
    }
}

fn describe(action: &Action, before: Option<&ClientPosition>, after: Option<&ClientPosition>) -> String {
    let balance = |p: Option<&ClientPosition>| p.map(|p| p.overpayment.to_string()).unwrap_or_default();
    let remaining = |p: Option<&ClientPosition>, id| {
        p.and_then(|p| p.loan.as_ref())
            .and_then(|lp| lp.installment(id).ok())
            .map(|i| i.remaining.to_string())
            .unwrap_or_default()
    };

    match *action {
        Action::DebitOverpayment { amount, reason, .. } => {
            let what = match reason {
                OverpaymentReason::AutoConsume => "apply standing credit to the loan",
                OverpaymentReason::Reversal => "take back credit this payment left",
                _ => "reduce standing credit",
            };
            format!(
                "would {}: reduce overpayment by {} ({} -> {})",
                what,
                amount,
                balance(before),
                balance(after)
            )
        }
        Action::CreditOverpayment { amount, reason, .. } => {
            let why = match reason {
                OverpaymentReason::NoActiveLoan => "client has no active loan",
                OverpaymentReason::FeeShortfall => "processing fee is not covered",
                OverpaymentReason::Residual => "installments are cleared",
                OverpaymentReason::Reversal => "restoring credit this payment consumed",
                _ => "manual adjustment",
            };
            format!(
                "would increase overpayment by {} because {} ({} -> {})",
                amount,
                why,
                balance(before),
                balance(after)
            )
        }
        Action::SettleFee { amount, .. } => format!("would settle processing fee of {}", amount),
        Action::SettleInstallment {
            installment_id,
            sequence,
            amount,
            fully_paid,
            ..
        } => {
            if fully_paid {
                format!("would pay installment #{} in full ({})", sequence, amount)
            } else {
                format!(
                    "would pay {} toward installment #{} ({} left)",
                    amount,
                    sequence,
                    remaining(after, installment_id)
                )
            }
        }
        Action::CompleteLoan { .. } => "would mark the loan completed".to_string(),
        Action::RevertInstallment {
            installment_id,
            sequence,
            amount,
            ..
        } => format!(
            "would revert installment #{} by {} (remaining {} -> {})",
            sequence,
            amount,
            remaining(before, installment_id),
            remaining(after, installment_id)
        ),
        Action::RevertFee { amount, .. } => {
            format!("would mark processing fee of {} as unpaid", amount)
        }
        Action::ReopenLoan { .. } => "would return the loan to active".to_string(),
        Action::SwitchLoan { to, .. } => {
            format!("would post the new amount against active loan {}", to)
        }
        Action::Blocked(Blocker::InsufficientCredit {
            available,
            required,
            ..
        }) => format!(
            "would block: {} of credit must be taken back but only {} remains",
            required, available
        ),
        Action::Blocked(Blocker::ReactivationBlocked { active_loan_id, .. }) => format!(
            "would block loan-status change because client has another active loan ({})",
            active_loan_id
        ),
        Action::VoidAllocations { lines, .. } => {
            format!("would void {} allocation line(s)", lines)
        }
        Action::VoidPayment { .. } => "would delete the payment".to_string(),
        Action::ChangeAmount { from, to, .. } => {
            format!("would change the payment amount from {} to {}", from, to)
        }
    }
}
