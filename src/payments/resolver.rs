use crate::errors::{EngineError, Result};
use crate::ledger::{LedgerRead, Loan};
use crate::types::ClientId;

/// find the single active loan for a client
///
/// No active loan is a NotFound the caller recovers from by diverting
/// the payment to standing credit. More than one active loan breaks a
/// ledger invariant and is reported as Internal.
pub fn resolve_active_loan<R: LedgerRead + ?Sized>(reader: &R, client_id: ClientId) -> Result<Loan> {
    let mut active = reader.active_loans(client_id)?;

    match active.len() {
        0 => Err(EngineError::NoActiveLoan { client_id }),
        1 => Ok(active.remove(0)),
        n => Err(EngineError::invariant(format!(
            "client {} holds {} active loans",
            client_id, n
        ))),
    }
}
