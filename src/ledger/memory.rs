use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    Client, Installment, LedgerRead, LedgerStore, LedgerTx, Loan, NewAllocation,
    NewOverpaymentTransaction, NewPayment, NonPosted, OverpaymentTransaction, PaymentAllocation,
};
use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::schedule::build_schedule;
use crate::types::{
    Actor, ClientId, InstallmentId, LoanId, LoanStatus, PaymentId, ProductId,
};

/// loan parameters used when seeding a disbursed loan
#[derive(Debug, Clone)]
pub struct LoanTerms {
    pub client_id: ClientId,
    pub product_id: ProductId,
    /// total repayable across all installments
    pub repayable: Money,
    pub installments: u32,
    pub period_days: u32,
    pub first_due: NaiveDate,
    pub processing_fee: Money,
    pub fee_paid: bool,
    pub status: LoanStatus,
}

impl LoanTerms {
    /// active weekly loan with no processing fee
    pub fn new(client_id: ClientId, repayable: Money, installments: u32, first_due: NaiveDate) -> Self {
        Self {
            client_id,
            product_id: Uuid::new_v4(),
            repayable,
            installments,
            period_days: 7,
            first_due,
            processing_fee: Money::ZERO,
            fee_paid: true,
            status: LoanStatus::Active,
        }
    }

    /// one-time fee that must clear before installments are paid
    pub fn processing_fee(mut self, fee: Money) -> Self {
        self.processing_fee = fee;
        self.fee_paid = fee.is_zero();
        self
    }

    pub fn period_days(mut self, days: u32) -> Self {
        self.period_days = days;
        self
    }

    pub fn status(mut self, status: LoanStatus) -> Self {
        self.status = status;
        self
    }
}

/// the relations the engine touches, held in memory
#[derive(Debug, Clone, Default)]
pub struct Tables {
    clients: HashMap<ClientId, Client>,
    loans: HashMap<LoanId, Loan>,
    installments: HashMap<InstallmentId, Installment>,
    payments: HashMap<PaymentId, NonPosted>,
    allocations: Vec<PaymentAllocation>,
    overpayment_log: Vec<OverpaymentTransaction>,
}

impl LedgerRead for Tables {
    fn client(&self, id: ClientId) -> Result<Option<Client>> {
        Ok(self.clients.get(&id).cloned())
    }

    fn client_by_reference(&self, reference: &str) -> Result<Option<Client>> {
        Ok(self
            .clients
            .values()
            .find(|c| c.matches_reference(reference))
            .cloned())
    }

    fn loan(&self, id: LoanId) -> Result<Option<Loan>> {
        Ok(self.loans.get(&id).cloned())
    }

    fn active_loans(&self, client_id: ClientId) -> Result<Vec<Loan>> {
        Ok(self
            .loans
            .values()
            .filter(|l| l.client_id == client_id && l.status == LoanStatus::Active)
            .cloned()
            .collect())
    }

    fn installments(&self, loan_id: LoanId) -> Result<Vec<Installment>> {
        let mut rows: Vec<Installment> = self
            .installments
            .values()
            .filter(|i| i.loan_id == loan_id)
            .cloned()
            .collect();
        rows.sort_by_key(|i| (i.due_date, i.sequence));
        Ok(rows)
    }

    fn unpaid_installments(&self, loan_id: LoanId) -> Result<Vec<Installment>> {
        let mut rows = self.installments(loan_id)?;
        rows.retain(|i| !i.paid);
        Ok(rows)
    }

    fn payment(&self, id: PaymentId) -> Result<Option<NonPosted>> {
        Ok(self.payments.get(&id).cloned())
    }

    fn payment_by_reference(&self, external_ref: &str) -> Result<Option<NonPosted>> {
        if external_ref.is_empty() {
            return Ok(None);
        }
        Ok(self
            .payments
            .values()
            .find(|p| p.external_ref == external_ref)
            .cloned())
    }

    fn allocations(&self, payment_id: PaymentId) -> Result<Vec<PaymentAllocation>> {
        Ok(self
            .allocations
            .iter()
            .filter(|a| a.payment_id == payment_id && a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    fn overpayment_transactions(&self, client_id: ClientId) -> Result<Vec<OverpaymentTransaction>> {
        Ok(self
            .overpayment_log
            .iter()
            .filter(|t| t.client_id == client_id)
            .cloned()
            .collect())
    }
}

/// in-memory ledger with serializable transactions
///
/// A transaction holds the table lock for its whole life and works on a
/// staged copy; commit swaps the copy in, rollback drops it.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a client with the identifiers payers may quote
    pub fn add_client(&self, name: &str, phone: &str, account_refs: &[&str]) -> Client {
        let client = Client {
            id: Uuid::new_v4(),
            name: name.to_string(),
            phone: phone.to_string(),
            account_refs: account_refs.iter().map(|r| r.to_string()).collect(),
            overpayment: Money::ZERO,
        };
        self.tables.lock().clients.insert(client.id, client.clone());
        client
    }

    /// create a disbursed loan together with its installment batch
    pub fn disburse_loan(&self, terms: LoanTerms) -> Result<(Loan, Vec<Installment>)> {
        let mut tables = self.tables.lock();

        if !tables.clients.contains_key(&terms.client_id) {
            return Err(EngineError::ClientNotFound {
                reference: terms.client_id.to_string(),
            });
        }
        if terms.status == LoanStatus::Active && !tables.active_loans(terms.client_id)?.is_empty() {
            return Err(EngineError::InvalidConfiguration {
                message: format!("client {} already holds an active loan", terms.client_id),
            });
        }

        let loan = Loan {
            id: Uuid::new_v4(),
            client_id: terms.client_id,
            product_id: terms.product_id,
            total_installments: terms.installments,
            installment_period_days: terms.period_days,
            processing_fee: terms.processing_fee,
            fee_paid: terms.fee_paid,
            paid_amount: Money::ZERO,
            status: terms.status,
        };
        let schedule = build_schedule(
            loan.id,
            terms.repayable,
            terms.installments,
            terms.period_days,
            terms.first_due,
        )?;

        tables.loans.insert(loan.id, loan.clone());
        for installment in &schedule {
            tables.installments.insert(installment.id, installment.clone());
        }

        Ok((loan, schedule))
    }

    /// give a client standing credit, with the matching audit entry
    pub fn seed_overpayment(&self, client_id: ClientId, amount: Money, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let client = tables
            .clients
            .get_mut(&client_id)
            .ok_or(EngineError::ClientNotFound {
                reference: client_id.to_string(),
            })?;
        client.overpayment += amount;

        tables.overpayment_log.push(OverpaymentTransaction {
            id: Uuid::new_v4(),
            client_id,
            payment_id: None,
            amount,
            description: "opening balance".to_string(),
            actor: Actor::System("seed".to_string()),
            created_at: at,
        });
        Ok(())
    }

    /// force a loan status, bypassing the engine
    pub fn set_loan_status(&self, loan_id: LoanId, status: LoanStatus) -> Result<()> {
        let mut tables = self.tables.lock();
        let loan = tables
            .loans
            .get_mut(&loan_id)
            .ok_or(EngineError::LoanNotFound { id: loan_id })?;
        loan.status = status;
        Ok(())
    }
}

impl LedgerStore for MemoryLedger {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>> {
        let guard = self.tables.lock();
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }

    fn read(&self) -> Result<Box<dyn LedgerRead + '_>> {
        Ok(Box::new(self.tables.lock().clone()))
    }
}

pub struct MemoryTx<'a> {
    guard: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl LedgerRead for MemoryTx<'_> {
    fn client(&self, id: ClientId) -> Result<Option<Client>> {
        self.staged.client(id)
    }

    fn client_by_reference(&self, reference: &str) -> Result<Option<Client>> {
        self.staged.client_by_reference(reference)
    }

    fn loan(&self, id: LoanId) -> Result<Option<Loan>> {
        self.staged.loan(id)
    }

    fn active_loans(&self, client_id: ClientId) -> Result<Vec<Loan>> {
        self.staged.active_loans(client_id)
    }

    fn installments(&self, loan_id: LoanId) -> Result<Vec<Installment>> {
        self.staged.installments(loan_id)
    }

    fn unpaid_installments(&self, loan_id: LoanId) -> Result<Vec<Installment>> {
        self.staged.unpaid_installments(loan_id)
    }

    fn payment(&self, id: PaymentId) -> Result<Option<NonPosted>> {
        self.staged.payment(id)
    }

    fn payment_by_reference(&self, external_ref: &str) -> Result<Option<NonPosted>> {
        self.staged.payment_by_reference(external_ref)
    }

    fn allocations(&self, payment_id: PaymentId) -> Result<Vec<PaymentAllocation>> {
        self.staged.allocations(payment_id)
    }

    fn overpayment_transactions(&self, client_id: ClientId) -> Result<Vec<OverpaymentTransaction>> {
        self.staged.overpayment_transactions(client_id)
    }
}

impl LedgerTx for MemoryTx<'_> {
    // the table lock is already held for the whole transaction
    fn lock_client(&mut self, id: ClientId) -> Result<Option<Client>> {
        self.staged.client(id)
    }

    fn lock_loan(&mut self, id: LoanId) -> Result<Option<Loan>> {
        self.staged.loan(id)
    }

    fn insert_payment(&mut self, payment: NewPayment) -> Result<NonPosted> {
        if self.staged.payment_by_reference(&payment.external_ref)?.is_some() {
            return Err(EngineError::DuplicateReference {
                reference: payment.external_ref,
            });
        }

        let row = NonPosted {
            id: Uuid::new_v4(),
            source: payment.source,
            external_ref: payment.external_ref,
            payer_account: payment.payer_account,
            payer_phone: payment.payer_phone,
            payer_name: payment.payer_name,
            amount: payment.amount,
            paid_at: payment.paid_at,
            client_id: payment.client_id,
            assigned_by: payment.assigned_by,
            assigned_at: payment.assigned_at,
            voided_at: None,
        };
        self.staged.payments.insert(row.id, row.clone());
        Ok(row)
    }

    fn update_payment(&mut self, payment: &NonPosted) -> Result<()> {
        let row = self
            .staged
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| EngineError::store("update payment", format!("no row {}", payment.id)))?;
        *row = payment.clone();
        Ok(())
    }

    fn insert_allocation(&mut self, allocation: NewAllocation) -> Result<PaymentAllocation> {
        let row = PaymentAllocation {
            id: Uuid::new_v4(),
            payment_id: allocation.payment_id,
            loan_id: allocation.loan_id,
            installment_id: allocation.installment_id,
            kind: allocation.kind,
            amount: allocation.amount,
            description: allocation.description,
            created_at: allocation.created_at,
            deleted_at: None,
        };
        self.staged.allocations.push(row.clone());
        Ok(row)
    }

    fn delete_allocations(&mut self, payment_id: PaymentId, at: DateTime<Utc>) -> Result<usize> {
        let mut count = 0;
        for row in self
            .staged
            .allocations
            .iter_mut()
            .filter(|a| a.payment_id == payment_id && a.deleted_at.is_none())
        {
            row.deleted_at = Some(at);
            count += 1;
        }
        Ok(count)
    }

    fn update_installment(&mut self, installment: &Installment) -> Result<()> {
        let row = self
            .staged
            .installments
            .get_mut(&installment.id)
            .ok_or_else(|| {
                EngineError::store("update installment", format!("no row {}", installment.id))
            })?;
        *row = installment.clone();
        Ok(())
    }

    fn update_loan(&mut self, loan: &Loan) -> Result<()> {
        let row = self
            .staged
            .loans
            .get_mut(&loan.id)
            .ok_or_else(|| EngineError::store("update loan", format!("no row {}", loan.id)))?;
        *row = loan.clone();
        Ok(())
    }

    fn set_overpayment(&mut self, client_id: ClientId, balance: Money) -> Result<()> {
        let row = self
            .staged
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| EngineError::store("set overpayment", format!("no client {}", client_id)))?;
        row.overpayment = balance;
        Ok(())
    }

    fn insert_overpayment_transaction(
        &mut self,
        entry: NewOverpaymentTransaction,
    ) -> Result<OverpaymentTransaction> {
        let row = OverpaymentTransaction {
            id: Uuid::new_v4(),
            client_id: entry.client_id,
            payment_id: entry.payment_id,
            amount: entry.amount,
            description: entry.description,
            actor: entry.actor,
            created_at: entry.created_at,
        };
        self.staged.overpayment_log.push(row.clone());
        Ok(row)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn first_due() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[test]
    fn test_rollback_discards_staged_writes() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Wanjiru", "254711000001", &["W-1"]);

        let mut tx = ledger.begin().unwrap();
        tx.set_overpayment(client.id, Money::from_major(50)).unwrap();
        assert_eq!(tx.client(client.id).unwrap().unwrap().overpayment, Money::from_major(50));
        tx.rollback().unwrap();

        let view = ledger.read().unwrap();
        assert_eq!(view.client(client.id).unwrap().unwrap().overpayment, Money::ZERO);
    }

    #[test]
    fn test_commit_publishes_staged_writes() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Otieno", "254711000002", &[]);

        let mut tx = ledger.begin().unwrap();
        tx.set_overpayment(client.id, Money::from_major(75)).unwrap();
        tx.commit().unwrap();

        let view = ledger.read().unwrap();
        assert_eq!(view.client(client.id).unwrap().unwrap().overpayment, Money::from_major(75));
    }

    #[test]
    fn test_one_active_loan_per_client() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Achieng", "254711000003", &[]);

        ledger
            .disburse_loan(LoanTerms::new(client.id, Money::from_major(3000), 3, first_due()))
            .unwrap();
        let second = ledger.disburse_loan(LoanTerms::new(client.id, Money::from_major(1000), 1, first_due()));
        assert!(second.is_err());

        // completed loans do not count against the limit
        let closed = LoanTerms::new(client.id, Money::from_major(500), 1, first_due())
            .status(LoanStatus::Completed);
        assert!(ledger.disburse_loan(closed).is_ok());
    }

    #[test]
    fn test_unpaid_installments_ordered_by_due_date() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Kamau", "254711000004", &[]);
        let (loan, schedule) = ledger
            .disburse_loan(LoanTerms::new(client.id, Money::from_major(3000), 3, first_due()).period_days(10))
            .unwrap();

        let mut tx = ledger.begin().unwrap();
        let mut first = schedule[0].clone();
        first
            .settle(first.remaining, Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap())
            .unwrap();
        tx.update_installment(&first).unwrap();

        let unpaid = tx.unpaid_installments(loan.id).unwrap();
        assert_eq!(unpaid.len(), 2);
        assert_eq!(unpaid[0].sequence, 2);
        assert!(unpaid[0].due_date < unpaid[1].due_date);
        tx.commit().unwrap();
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let ledger = MemoryLedger::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        let new_payment = || NewPayment {
            source: crate::types::TransactionSource::External,
            external_ref: "QK12XYZ".to_string(),
            payer_account: "W-1".to_string(),
            payer_phone: "254711000001".to_string(),
            payer_name: "W".to_string(),
            amount: Money::from_major(10),
            paid_at: at,
            client_id: None,
            assigned_by: None,
            assigned_at: None,
        };

        let mut tx = ledger.begin().unwrap();
        tx.insert_payment(new_payment()).unwrap();
        let err = tx.insert_payment(new_payment()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateReference { .. }));
        tx.rollback().unwrap();
    }
}
