//! Store boundary for the allocation engine.
//!
//! The engine never owns the schema. It reads and writes the `loans`,
//! `installments`, `non_posted_payments`, `payment_allocations` and
//! `client_overpayment_transactions` relations (plus the client's
//! `overpayment` scalar) through these traits. A relational backend maps
//! `lock_client` / `lock_loan` onto `SELECT ... FOR UPDATE`.

pub mod memory;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::types::{
    Actor, AllocationId, AllocationKind, ClientId, InstallmentId, LoanId, LoanStatus, PaymentId,
    ProductId, StaffId, TransactionSource,
};

pub use memory::{LoanTerms, MemoryLedger};

/// client row, reduced to what the engine reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub phone: String,
    /// identifiers a payer may quote as the account reference
    pub account_refs: Vec<String>,
    /// standing credit balance
    pub overpayment: Money,
}

impl Client {
    pub fn matches_reference(&self, reference: &str) -> bool {
        let reference = reference.trim();
        !reference.is_empty()
            && (self.phone == reference || self.account_refs.iter().any(|r| r == reference))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub client_id: ClientId,
    pub product_id: ProductId,
    pub total_installments: u32,
    pub installment_period_days: u32,
    pub processing_fee: Money,
    pub fee_paid: bool,
    /// money retired against installments so far
    pub paid_amount: Money,
    pub status: LoanStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    pub loan_id: LoanId,
    pub sequence: u32,
    pub amount_due: Money,
    pub remaining: Money,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub due_date: NaiveDate,
}

impl Installment {
    /// apply `amount` against the remaining balance
    ///
    /// Marks the installment paid when the remaining balance reaches zero.
    pub fn settle(&mut self, amount: Money, at: DateTime<Utc>) -> Result<()> {
        if !amount.is_positive() || amount > self.remaining {
            return Err(EngineError::invariant(format!(
                "installment #{} cannot absorb {} (remaining {})",
                self.sequence, amount, self.remaining
            )));
        }

        self.remaining -= amount;
        if self.remaining.is_zero() {
            self.paid = true;
            self.paid_at = Some(at);
        }
        Ok(())
    }

    /// give back `amount` previously settled against this installment
    pub fn revert(&mut self, amount: Money) -> Result<()> {
        let restored = self.remaining + amount;
        if !amount.is_positive() || restored > self.amount_due {
            return Err(EngineError::invariant(format!(
                "installment #{} cannot restore {} (remaining {}, due {})",
                self.sequence, amount, self.remaining, self.amount_due
            )));
        }

        self.remaining = restored;
        self.paid = false;
        self.paid_at = None;
        Ok(())
    }
}

/// an incoming payment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonPosted {
    pub id: PaymentId,
    pub source: TransactionSource,
    pub external_ref: String,
    pub payer_account: String,
    pub payer_phone: String,
    pub payer_name: String,
    pub amount: Money,
    pub paid_at: DateTime<Utc>,
    pub client_id: Option<ClientId>,
    pub assigned_by: Option<StaffId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub source: TransactionSource,
    pub external_ref: String,
    pub payer_account: String,
    pub payer_phone: String,
    pub payer_name: String,
    pub amount: Money,
    pub paid_at: DateTime<Utc>,
    pub client_id: Option<ClientId>,
    pub assigned_by: Option<StaffId>,
    pub assigned_at: Option<DateTime<Utc>>,
}

/// one ledger line recording where a slice of a payment went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub id: AllocationId,
    pub payment_id: PaymentId,
    pub loan_id: Option<LoanId>,
    pub installment_id: Option<InstallmentId>,
    pub kind: AllocationKind,
    pub amount: Money,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub payment_id: PaymentId,
    pub loan_id: Option<LoanId>,
    pub installment_id: Option<InstallmentId>,
    pub kind: AllocationKind,
    pub amount: Money,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// audit entry for every standing-credit change (signed amount)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverpaymentTransaction {
    pub id: uuid::Uuid,
    pub client_id: ClientId,
    pub payment_id: Option<PaymentId>,
    pub amount: Money,
    pub description: String,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOverpaymentTransaction {
    pub client_id: ClientId,
    pub payment_id: Option<PaymentId>,
    pub amount: Money,
    pub description: String,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

/// read side of the store
pub trait LedgerRead {
    fn client(&self, id: ClientId) -> Result<Option<Client>>;

    /// match a payer's account reference against client identifiers
    fn client_by_reference(&self, reference: &str) -> Result<Option<Client>>;

    fn loan(&self, id: LoanId) -> Result<Option<Loan>>;

    fn active_loans(&self, client_id: ClientId) -> Result<Vec<Loan>>;

    /// every installment of the loan, earliest due first
    fn installments(&self, loan_id: LoanId) -> Result<Vec<Installment>>;

    /// unpaid installments of the loan, earliest due first
    fn unpaid_installments(&self, loan_id: LoanId) -> Result<Vec<Installment>>;

    fn payment(&self, id: PaymentId) -> Result<Option<NonPosted>>;

    fn payment_by_reference(&self, external_ref: &str) -> Result<Option<NonPosted>>;

    /// allocation lines of a payment that have not been soft-deleted, oldest first
    fn allocations(&self, payment_id: PaymentId) -> Result<Vec<PaymentAllocation>>;

    fn overpayment_transactions(&self, client_id: ClientId) -> Result<Vec<OverpaymentTransaction>>;
}

/// one atomic unit of work
pub trait LedgerTx: LedgerRead {
    /// read the client row and hold it until commit or rollback
    fn lock_client(&mut self, id: ClientId) -> Result<Option<Client>>;

    /// read the loan row and hold it until commit or rollback
    fn lock_loan(&mut self, id: LoanId) -> Result<Option<Loan>>;

    fn insert_payment(&mut self, payment: NewPayment) -> Result<NonPosted>;

    fn update_payment(&mut self, payment: &NonPosted) -> Result<()>;

    fn insert_allocation(&mut self, allocation: NewAllocation) -> Result<PaymentAllocation>;

    /// mark every live allocation line of the payment as deleted; returns how many
    fn delete_allocations(&mut self, payment_id: PaymentId, at: DateTime<Utc>) -> Result<usize>;

    fn update_installment(&mut self, installment: &Installment) -> Result<()>;

    fn update_loan(&mut self, loan: &Loan) -> Result<()>;

    fn set_overpayment(&mut self, client_id: ClientId, balance: Money) -> Result<()>;

    fn insert_overpayment_transaction(
        &mut self,
        entry: NewOverpaymentTransaction,
    ) -> Result<OverpaymentTransaction>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// a store that hands out transactions and read snapshots
pub trait LedgerStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>>;

    fn read(&self) -> Result<Box<dyn LedgerRead + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn installment(due: i64) -> Installment {
        Installment {
            id: Uuid::new_v4(),
            loan_id: Uuid::new_v4(),
            sequence: 1,
            amount_due: Money::from_major(due),
            remaining: Money::from_major(due),
            paid: false,
            paid_at: None,
            due_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        }
    }

    #[test]
    fn test_installment_settle_and_revert() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap();
        let mut inst = installment(1000);

        inst.settle(Money::from_major(400), at).unwrap();
        assert_eq!(inst.remaining, Money::from_major(600));
        assert!(!inst.paid);

        inst.settle(Money::from_major(600), at).unwrap();
        assert!(inst.paid);
        assert_eq!(inst.paid_at, Some(at));

        inst.revert(Money::from_major(600)).unwrap();
        assert_eq!(inst.remaining, Money::from_major(600));
        assert!(!inst.paid);
        assert_eq!(inst.paid_at, None);
    }

    #[test]
    fn test_installment_bounds() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap();
        let mut inst = installment(100);

        // never below zero, never above amount due
        assert!(inst.settle(Money::from_major(101), at).is_err());
        assert!(inst.revert(Money::from_major(1)).is_err());
        assert!(inst.settle(Money::ZERO, at).is_err());
        assert_eq!(inst.remaining, Money::from_major(100));
    }

    #[test]
    fn test_client_reference_matching() {
        let client = Client {
            id: Uuid::new_v4(),
            name: "Amina".to_string(),
            phone: "254700000001".to_string(),
            account_refs: vec!["ACC-001".to_string()],
            overpayment: Money::ZERO,
        };

        assert!(client.matches_reference("ACC-001"));
        assert!(client.matches_reference(" 254700000001 "));
        assert!(!client.matches_reference("ACC-002"));
        assert!(!client.matches_reference(""));
    }
}
