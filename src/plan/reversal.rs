use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::ledger::{NonPosted, PaymentAllocation};
use crate::payments::validate_amount;
use crate::state::{ClientPosition, LoanTarget};
use crate::types::{AllocationKind, LoanStatus, OverpaymentReason, TransactionSource};

use super::{plan_posting, Action, Blocker, Branch, Plan};

/// only live payments entered inside our own app may be edited or deleted
pub fn ensure_editable(payment: &NonPosted) -> Result<()> {
    if payment.source != TransactionSource::Internal {
        return Err(EngineError::NotInternalSource {
            id: payment.id,
            origin: payment.source,
        });
    }
    if payment.voided_at.is_some() {
        return Err(EngineError::PaymentVoided { id: payment.id });
    }
    Ok(())
}

/// loan a reversal must load: the one the payment was allocated to, else the active one
pub fn reversal_target(allocations: &[PaymentAllocation]) -> LoanTarget {
    allocations
        .iter()
        .find_map(|a| a.loan_id)
        .map(LoanTarget::Loan)
        .unwrap_or(LoanTarget::Active)
}

/// undo a posted payment and void it
pub fn plan_reversal(
    position: Option<&ClientPosition>,
    payment: &NonPosted,
    allocations: &[PaymentAllocation],
) -> Result<Plan> {
    ensure_editable(payment)?;

    let mut plan = match position {
        Some(position) => undo_allocations(position, payment, allocations)?.0,
        None => unattributed(payment, allocations)?,
    };
    plan.actions.push(Action::VoidPayment {
        payment_id: payment.id,
    });
    Ok(plan)
}

/// undo a posted payment, change its amount and post it again
///
/// Re-posting is planned against the position as it stands after the
/// reversal, so freed credit and a reopened loan are both visible to it.
/// When the reverted loan no longer takes payments and the client has
/// another active loan, the new amount goes to that loan.
pub fn plan_amendment(
    position: Option<&ClientPosition>,
    payment: &NonPosted,
    allocations: &[PaymentAllocation],
    new_amount: Money,
) -> Result<Plan> {
    ensure_editable(payment)?;
    validate_amount(new_amount)?;

    let change = Action::ChangeAmount {
        payment_id: payment.id,
        from: payment.amount,
        to: new_amount,
    };

    let Some(position) = position else {
        let mut plan = unattributed(payment, allocations)?;
        plan.branch = Branch::Amendment;
        plan.actions.push(change);
        return Ok(plan);
    };

    let (mut plan, mut reverted) = undo_allocations(position, payment, allocations)?;
    plan.branch = Branch::Amendment;
    plan.actions.push(change);
    if plan.is_blocked() {
        return Ok(plan);
    }

    let switch = match (reverted.loan.as_ref(), reverted.active_loan.as_ref()) {
        (Some(lp), Some(active)) if lp.loan.status != LoanStatus::Active => Some(Action::SwitchLoan {
            from: lp.loan.id,
            to: active.loan.id,
        }),
        _ => None,
    };
    if let Some(switch) = switch {
        switch.apply_to(&mut reverted, payment.paid_at)?;
        plan.actions.push(switch);
    }

    let repost = plan_posting(&reverted, new_amount)?;
    plan.loan_id = repost.loan_id.or(plan.loan_id);
    plan.actions.extend(repost.actions);
    Ok(plan)
}

/// unattributed payments never carry allocation lines
fn unattributed(payment: &NonPosted, allocations: &[PaymentAllocation]) -> Result<Plan> {
    if !allocations.is_empty() {
        return Err(EngineError::invariant(format!(
            "unattributed payment {} has {} allocation lines",
            payment.id,
            allocations.len()
        )));
    }
    Ok(Plan {
        branch: Branch::Reversal,
        ..Plan::unattributed()
    })
}

/// reverse every live allocation line, newest first
///
/// Returns the plan and the position it leaves behind. Steps that cannot
/// go ahead are kept in the plan as [`Action::Blocked`] so a dry run can
/// report them; the position skips them.
fn undo_allocations(
    position: &ClientPosition,
    payment: &NonPosted,
    allocations: &[PaymentAllocation],
) -> Result<(Plan, ClientPosition)> {
    let client_id = position.client_id;
    if payment.client_id != Some(client_id) {
        return Err(EngineError::invariant(format!(
            "payment {} does not belong to client {}",
            payment.id, client_id
        )));
    }

    let mut scratch = position.clone();
    let mut actions = Vec::new();
    let mut reopens = false;
    let mut loan_id = None;

    for line in allocations.iter().rev() {
        let action = match line.kind {
            AllocationKind::Installment => {
                let (line_loan, installment_id) = match (line.loan_id, line.installment_id) {
                    (Some(l), Some(i)) => (l, i),
                    _ => return Err(malformed(line)),
                };
                let sequence = scratch
                    .loan
                    .as_ref()
                    .ok_or_else(|| malformed(line))?
                    .installment(installment_id)?
                    .sequence;
                reopens = true;
                loan_id = Some(line_loan);
                Action::RevertInstallment {
                    loan_id: line_loan,
                    installment_id,
                    sequence,
                    amount: line.amount,
                }
            }
            AllocationKind::ProcessingFee => {
                let line_loan = line.loan_id.ok_or_else(|| malformed(line))?;
                reopens = true;
                loan_id = Some(line_loan);
                Action::RevertFee {
                    loan_id: line_loan,
                    amount: line.amount,
                }
            }
            AllocationKind::OverpaymentCredit => {
                if scratch.overpayment < line.amount {
                    Action::Blocked(Blocker::InsufficientCredit {
                        client_id,
                        available: scratch.overpayment,
                        required: line.amount,
                    })
                } else {
                    Action::DebitOverpayment {
                        client_id,
                        amount: line.amount,
                        reason: OverpaymentReason::Reversal,
                    }
                }
            }
            AllocationKind::OverpaymentDebit => Action::CreditOverpayment {
                client_id,
                amount: line.amount.abs(),
                reason: OverpaymentReason::Reversal,
            },
        };

        if !matches!(action, Action::Blocked(_)) {
            action.apply_to(&mut scratch, payment.paid_at)?;
        }
        actions.push(action);
    }

    // an unpaid fee or installment means the loan is owed again
    if reopens {
        if let Some(lp) = scratch.loan.as_ref().filter(|lp| lp.loan.status == LoanStatus::Completed) {
            let action = match lp.other_active_loan {
                Some(active_loan_id) => Action::Blocked(Blocker::ReactivationBlocked {
                    loan_id: lp.loan.id,
                    active_loan_id,
                }),
                None => Action::ReopenLoan { loan_id: lp.loan.id },
            };
            if !matches!(action, Action::Blocked(_)) {
                action.apply_to(&mut scratch, payment.paid_at)?;
            }
            actions.push(action);
        }
    }

    if !allocations.is_empty() {
        actions.push(Action::VoidAllocations {
            payment_id: payment.id,
            lines: allocations.len(),
        });
    }

    let plan = Plan {
        branch: Branch::Reversal,
        client_id: Some(client_id),
        loan_id,
        actions,
    };
    Ok((plan, scratch))
}

fn malformed(line: &PaymentAllocation) -> EngineError {
    EngineError::invariant(format!(
        "allocation line {} ({:?}) does not match the loaded loan",
        line.id, line.kind
    ))
}
