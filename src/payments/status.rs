use crate::errors::{EngineError, Result};
use crate::ledger::{LedgerTx, Loan};
use crate::types::{LoanId, LoanStatus};

/// whether a loan is allowed to move from `from` to `to`
pub fn can_transition(from: LoanStatus, to: LoanStatus) -> bool {
    use LoanStatus::*;
    matches!(
        (from, to),
        (Inactive, Active) | (Active, Completed) | (Active, Defaulted) | (Completed, Active) | (Defaulted, Active)
    )
}

/// mark the loan completed once the store shows no unpaid installments
///
/// Re-reads unpaid installments inside the transaction so earlier writes in
/// the same unit of work are seen. Returns the updated loan when the status
/// changed and `None` when there was nothing to do, so repeated calls are
/// harmless.
pub fn complete_if_settled<T: LedgerTx + ?Sized>(tx: &mut T, loan_id: LoanId) -> Result<Option<Loan>> {
    let mut loan = tx.lock_loan(loan_id)?.ok_or(EngineError::LoanNotFound { id: loan_id })?;
    if loan.status == LoanStatus::Completed {
        return Ok(None);
    }

    let unpaid = tx.unpaid_installments(loan_id)?;
    if !unpaid.is_empty() {
        return Ok(None);
    }

    if !can_transition(loan.status, LoanStatus::Completed) {
        return Err(EngineError::invariant(format!(
            "loan {} cannot complete from {:?}",
            loan.id, loan.status
        )));
    }
    loan.status = LoanStatus::Completed;
    tx.update_loan(&loan)?;
    Ok(Some(loan))
}
