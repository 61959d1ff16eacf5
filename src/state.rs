use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::ledger::{Client, Installment, LedgerRead, LedgerTx, Loan};
use crate::payments::resolver;
use crate::types::{ClientId, InstallmentId, LoanId, LoanStatus};

/// which loan a position should be built around
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanTarget {
    /// the client's single active loan, if any
    Active,
    /// a specific loan, regardless of status
    Loan(LoanId),
}

/// everything the planner needs to decide where a payment goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPosition {
    pub client_id: ClientId,
    /// standing credit balance
    pub overpayment: Money,
    pub loan: Option<LoanPosition>,
    /// the client's active loan, loaded when `loan` is some other loan that is not active
    pub active_loan: Option<LoanPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanPosition {
    pub loan: Loan,
    /// every installment, earliest due first
    pub installments: Vec<Installment>,
    /// a different active loan held by the same client
    pub other_active_loan: Option<LoanId>,
}

impl ClientPosition {
    /// load with the client and loan rows locked for the rest of the transaction
    pub fn lock<T: LedgerTx + ?Sized>(tx: &mut T, client_id: ClientId, target: LoanTarget) -> Result<Self> {
        let client = tx
            .lock_client(client_id)?
            .ok_or(EngineError::ClientNotFound {
                reference: client_id.to_string(),
            })?;

        let loan_id = match target {
            LoanTarget::Active => active_loan_id(&*tx, client_id)?,
            LoanTarget::Loan(id) => Some(id),
        };
        let loan = match loan_id {
            Some(id) => Some(tx.lock_loan(id)?.ok_or(EngineError::LoanNotFound { id })?),
            None => None,
        };

        let mut position = Self::assemble(&*tx, client, loan)?;
        if let Some(id) = position.standby_loan_id() {
            let loan = tx.lock_loan(id)?.ok_or(EngineError::LoanNotFound { id })?;
            position.active_loan = Some(LoanPosition::load(&*tx, loan)?);
        }
        Ok(position)
    }

    /// load from a read-only view, for dry runs
    pub fn read<R: LedgerRead + ?Sized>(reader: &R, client_id: ClientId, target: LoanTarget) -> Result<Self> {
        let client = reader
            .client(client_id)?
            .ok_or(EngineError::ClientNotFound {
                reference: client_id.to_string(),
            })?;

        let loan = match target {
            LoanTarget::Active => active_loan_id(reader, client_id)?,
            LoanTarget::Loan(id) => Some(id),
        }
        .map(|id| reader.loan(id)?.ok_or(EngineError::LoanNotFound { id }))
        .transpose()?;

        let mut position = Self::assemble(reader, client, loan)?;
        if let Some(id) = position.standby_loan_id() {
            let loan = reader.loan(id)?.ok_or(EngineError::LoanNotFound { id })?;
            position.active_loan = Some(LoanPosition::load(reader, loan)?);
        }
        Ok(position)
    }

    fn assemble<R: LedgerRead + ?Sized>(reader: &R, client: Client, loan: Option<Loan>) -> Result<Self> {
        let loan = match loan {
            Some(loan) => {
                if loan.client_id != client.id {
                    return Err(EngineError::invariant(format!(
                        "loan {} does not belong to client {}",
                        loan.id, client.id
                    )));
                }
                Some(LoanPosition::load(reader, loan)?)
            }
            None => None,
        };

        Ok(Self {
            client_id: client.id,
            overpayment: client.overpayment,
            loan,
            active_loan: None,
        })
    }

    /// another loan to post against when the loaded one no longer takes payments
    fn standby_loan_id(&self) -> Option<LoanId> {
        self.loan
            .as_ref()
            .filter(|lp| lp.loan.status != LoanStatus::Active)
            .and_then(|lp| lp.other_active_loan)
    }

    pub fn loan_id(&self) -> Option<LoanId> {
        self.loan.as_ref().map(|l| l.loan.id)
    }
}

impl LoanPosition {
    fn load<R: LedgerRead + ?Sized>(reader: &R, loan: Loan) -> Result<Self> {
        let installments = reader.installments(loan.id)?;
        let other_active_loan = reader
            .active_loans(loan.client_id)?
            .into_iter()
            .find(|other| other.id != loan.id)
            .map(|other| other.id);
        Ok(Self {
            loan,
            installments,
            other_active_loan,
        })
    }

    pub fn installment(&self, id: InstallmentId) -> Result<&Installment> {
        self.installments
            .iter()
            .find(|i| i.id == id)
            .ok_or(EngineError::InstallmentNotFound { id })
    }

    pub fn installment_mut(&mut self, id: InstallmentId) -> Result<&mut Installment> {
        self.installments
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(EngineError::InstallmentNotFound { id })
    }

    pub fn unpaid(&self) -> impl Iterator<Item = &Installment> {
        self.installments.iter().filter(|i| !i.paid)
    }

    pub fn outstanding(&self) -> Money {
        self.unpaid().map(|i| i.remaining).sum()
    }
}

/// the client's active loan, with "none" recovered as `None`
fn active_loan_id<R: LedgerRead + ?Sized>(reader: &R, client_id: ClientId) -> Result<Option<LoanId>> {
    match resolver::resolve_active_loan(reader, client_id) {
        Ok(loan) => Ok(Some(loan.id)),
        Err(EngineError::NoActiveLoan { .. }) => Ok(None),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerStore, LoanTerms, MemoryLedger};
    use chrono::NaiveDate;

    fn first_due() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    #[test]
    fn test_position_without_loan() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Njeri", "254722000001", &[]);

        let view = ledger.read().unwrap();
        let position = ClientPosition::read(&*view, client.id, LoanTarget::Active).unwrap();

        assert_eq!(position.client_id, client.id);
        assert!(position.loan.is_none());
        assert!(position.active_loan.is_none());
        assert_eq!(position.overpayment, Money::ZERO);
    }

    #[test]
    fn test_position_reports_other_active_loan() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Mutua", "254722000002", &[]);
        let (closed, _) = ledger
            .disburse_loan(
                LoanTerms::new(client.id, Money::from_major(900), 3, first_due()).status(LoanStatus::Completed),
            )
            .unwrap();
        let (active, _) = ledger
            .disburse_loan(LoanTerms::new(client.id, Money::from_major(1200), 4, first_due()))
            .unwrap();

        let mut tx = ledger.begin().unwrap();
        let position = ClientPosition::lock(tx.as_mut(), client.id, LoanTarget::Loan(closed.id)).unwrap();
        tx.rollback().unwrap();

        let standby = position.active_loan.unwrap();
        assert_eq!(standby.loan.id, active.id);
        assert_eq!(standby.installments.len(), 4);
        assert_eq!(standby.other_active_loan, None);

        let loan = position.loan.unwrap();
        assert_eq!(loan.loan.id, closed.id);
        assert_eq!(loan.other_active_loan, Some(active.id));
        assert_eq!(loan.installments.len(), 3);
        assert_eq!(loan.outstanding(), Money::from_major(900));
    }

    #[test]
    fn test_unknown_client() {
        let ledger = MemoryLedger::new();
        let view = ledger.read().unwrap();
        let err = ClientPosition::read(&*view, uuid::Uuid::new_v4(), LoanTarget::Active).unwrap_err();
        assert!(matches!(err, EngineError::ClientNotFound { .. }));
    }
}
