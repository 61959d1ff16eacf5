use chrono::{Duration, NaiveDate};
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::ledger::Installment;
use crate::types::LoanId;

/// build the installment batch created when a loan is disbursed
///
/// `total` is split into `count` equal installments due every
/// `period_days`, starting at `first_due`. The last installment absorbs
/// the rounding remainder so the schedule sums to `total` exactly.
pub fn build_schedule(
    loan_id: LoanId,
    total: Money,
    count: u32,
    period_days: u32,
    first_due: NaiveDate,
) -> Result<Vec<Installment>> {
    if count == 0 {
        return Err(EngineError::InvalidConfiguration {
            message: "loan needs at least one installment".to_string(),
        });
    }
    if !total.is_positive() {
        return Err(EngineError::InvalidPaymentAmount { amount: total });
    }

    let installments = total
        .split_even(count)
        .into_iter()
        .enumerate()
        .map(|(index, amount)| Installment {
            id: Uuid::new_v4(),
            loan_id,
            sequence: index as u32 + 1,
            amount_due: amount,
            remaining: amount,
            paid: false,
            paid_at: None,
            due_date: first_due + Duration::days(period_days as i64 * index as i64),
        })
        .collect();

    Ok(installments)
}
