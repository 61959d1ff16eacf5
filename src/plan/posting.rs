use crate::decimal::Money;
use crate::errors::Result;
use crate::payments::{allocate, settle_fee, validate_amount, FeeDecision};
use crate::state::ClientPosition;
use crate::types::{LoanStatus, OverpaymentReason};

use super::{Action, Branch, Plan};

/// decide where a newly attributed payment goes
///
/// Standing credit joins the pool only once the processing fee is covered;
/// when it is not, the new amount is parked and existing credit stays put.
pub fn plan_posting(position: &ClientPosition, amount: Money) -> Result<Plan> {
    validate_amount(amount)?;
    let client_id = position.client_id;

    let lp = match position
        .loan
        .as_ref()
        .filter(|lp| lp.loan.status == LoanStatus::Active)
    {
        Some(lp) => lp,
        None => {
            return Ok(Plan {
                branch: Branch::NoActiveLoan,
                client_id: Some(client_id),
                loan_id: None,
                actions: vec![Action::CreditOverpayment {
                    client_id,
                    amount,
                    reason: OverpaymentReason::NoActiveLoan,
                }],
            })
        }
    };
    let loan_id = lp.loan.id;

    let standing = position.overpayment.max(Money::ZERO);
    let decision = settle_fee(&lp.loan, amount + standing);

    if decision.is_shortfall() {
        return Ok(Plan {
            branch: Branch::FeeShortfall,
            client_id: Some(client_id),
            loan_id: Some(loan_id),
            actions: vec![Action::CreditOverpayment {
                client_id,
                amount,
                reason: OverpaymentReason::FeeShortfall,
            }],
        });
    }

    let mut actions = Vec::new();
    if standing.is_positive() {
        actions.push(Action::DebitOverpayment {
            client_id,
            amount: standing,
            reason: OverpaymentReason::AutoConsume,
        });
    }
    if let FeeDecision::Settled { fee, .. } = decision {
        actions.push(Action::SettleFee { loan_id, amount: fee });
    }

    let allocation = allocate(&lp.installments, decision.pool());
    actions.extend(allocation.settlements.iter().map(|s| Action::SettleInstallment {
        loan_id,
        installment_id: s.installment_id,
        sequence: s.sequence,
        amount: s.amount,
        fully_paid: s.fully_settled,
    }));

    if allocation.residual.is_positive() {
        actions.push(Action::CreditOverpayment {
            client_id,
            amount: allocation.residual,
            reason: OverpaymentReason::Residual,
        });
    }
    if allocation.clears(&lp.installments) {
        actions.push(Action::CompleteLoan { loan_id });
    }

    Ok(Plan {
        branch: Branch::Allocated,
        client_id: Some(client_id),
        loan_id: Some(loan_id),
        actions,
    })
}
