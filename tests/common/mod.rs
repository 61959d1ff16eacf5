#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use payment_allocation::ledger::{NewAllocation, NewOverpaymentTransaction, NewPayment};
use payment_allocation::{
    CallContext, Client, EngineConfig, EngineError, IncomingPayment, Installment, LedgerRead,
    LedgerStore, LedgerTx, Loan, LoanTerms, ManualPayment, MemoryLedger, Money, NonPosted,
    OverpaymentTransaction, PaymentAllocation, PaymentOutcome, PaymentRouter, Result,
    SafeTimeProvider, TimeSource, TransactionSource,
};
use uuid::Uuid;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn first_due() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
}

pub fn clock() -> SafeTimeProvider {
    SafeTimeProvider::new(TimeSource::Test(start()))
}

pub fn staff() -> Uuid {
    Uuid::from_u128(0x5747_0000_0000_0000_0000_0000_0000_0001)
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub router: Arc<PaymentRouter>,
    pub time: SafeTimeProvider,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let time = clock();
        let router = PaymentRouter::builder()
            .store(ledger.clone())
            .time(time.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            ledger,
            router: Arc::new(router),
            time,
        }
    }

    pub fn client(&self, account: &str, phone: &str) -> Client {
        self.ledger.add_client(account, phone, &[account])
    }

    pub fn loan(&self, terms: LoanTerms) -> (Loan, Vec<Installment>) {
        self.ledger.disburse_loan(terms).unwrap()
    }

    pub fn receive(&self, reference: &str, account: &str, amount: Money) -> Result<PaymentOutcome> {
        self.router.receive(
            IncomingPayment {
                external_ref: reference.to_string(),
                payer_account: account.to_string(),
                payer_phone: "254700000000".to_string(),
                payer_name: account.to_string(),
                amount,
                paid_at: None,
                origin: TransactionSource::External,
            },
            &CallContext::background(),
        )
    }

    pub fn manual(&self, client: &Client, amount: Money) -> PaymentOutcome {
        self.router
            .record_manual(
                ManualPayment {
                    client_id: client.id,
                    amount,
                    staff_id: staff(),
                    reference: None,
                    paid_at: None,
                },
                &CallContext::background(),
            )
            .unwrap()
    }

    pub fn view(&self) -> Box<dyn LedgerRead + '_> {
        self.ledger.read().unwrap()
    }

    pub fn balance(&self, client: &Client) -> Money {
        self.view().client(client.id).unwrap().unwrap().overpayment
    }

    pub fn installments(&self, loan: &Loan) -> Vec<Installment> {
        self.view().installments(loan.id).unwrap()
    }

    pub fn loan_row(&self, loan: &Loan) -> Loan {
        self.view().loan(loan.id).unwrap().unwrap()
    }

    pub fn allocations(&self, payment: &NonPosted) -> Vec<PaymentAllocation> {
        self.view().allocations(payment.id).unwrap()
    }

    /// live allocation lines of a payment sum to its amount
    pub fn assert_conserved(&self, payment_id: Uuid) {
        let view = self.view();
        let payment = view.payment(payment_id).unwrap().unwrap();
        let total: Money = view.allocations(payment_id).unwrap().iter().map(|a| a.amount).sum();
        assert_eq!(total, payment.amount, "allocation lines must sum to the payment amount");
    }

    pub fn assert_reconciled(&self, client: &Client) {
        let reconciliation = self.router.reconcile(client.id).unwrap();
        assert!(
            reconciliation.is_balanced(),
            "balance {} but log sums to {}",
            reconciliation.balance,
            reconciliation.logged
        );
        assert!(!reconciliation.balance.is_negative());
    }
}

/// where a faulty store should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    InsertAllocation,
    UpdateLoan,
    Commit,
}

/// wraps the memory ledger and fails on demand
pub struct FaultyLedger {
    pub inner: MemoryLedger,
    fault: parking_lot::Mutex<Option<(FaultPoint, usize)>>,
    rollback_fails: AtomicBool,
    rollbacks: AtomicUsize,
}

impl FaultyLedger {
    pub fn new() -> Self {
        Self {
            inner: MemoryLedger::new(),
            fault: parking_lot::Mutex::new(None),
            rollback_fails: AtomicBool::new(false),
            rollbacks: AtomicUsize::new(0),
        }
    }

    /// fail the `nth` call (0-based) to `point` in the next transaction
    pub fn fail_at(&self, point: FaultPoint, nth: usize) {
        *self.fault.lock() = Some((point, nth));
    }

    pub fn fail_rollback(&self) {
        self.rollback_fails.store(true, Ordering::SeqCst);
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl LedgerStore for FaultyLedger {
    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>> {
        Ok(Box::new(FaultyTx {
            inner: self.inner.begin()?,
            fault: self.fault.lock().take(),
            calls: 0,
            owner: self,
        }))
    }

    fn read(&self) -> Result<Box<dyn LedgerRead + '_>> {
        self.inner.read()
    }
}

struct FaultyTx<'a> {
    inner: Box<dyn LedgerTx + 'a>,
    fault: Option<(FaultPoint, usize)>,
    calls: usize,
    owner: &'a FaultyLedger,
}

impl FaultyTx<'_> {
    fn trip(&mut self, point: FaultPoint) -> Result<()> {
        if let Some((target, nth)) = self.fault {
            if target == point {
                if self.calls == nth {
                    return Err(EngineError::store("injected", format!("{:?} failed", point)));
                }
                self.calls += 1;
            }
        }
        Ok(())
    }
}

impl LedgerRead for FaultyTx<'_> {
    fn client(&self, id: Uuid) -> Result<Option<Client>> {
        self.inner.client(id)
    }

    fn client_by_reference(&self, reference: &str) -> Result<Option<Client>> {
        self.inner.client_by_reference(reference)
    }

    fn loan(&self, id: Uuid) -> Result<Option<Loan>> {
        self.inner.loan(id)
    }

    fn active_loans(&self, client_id: Uuid) -> Result<Vec<Loan>> {
        self.inner.active_loans(client_id)
    }

    fn installments(&self, loan_id: Uuid) -> Result<Vec<Installment>> {
        self.inner.installments(loan_id)
    }

    fn unpaid_installments(&self, loan_id: Uuid) -> Result<Vec<Installment>> {
        self.inner.unpaid_installments(loan_id)
    }

    fn payment(&self, id: Uuid) -> Result<Option<NonPosted>> {
        self.inner.payment(id)
    }

    fn payment_by_reference(&self, external_ref: &str) -> Result<Option<NonPosted>> {
        self.inner.payment_by_reference(external_ref)
    }

    fn allocations(&self, payment_id: Uuid) -> Result<Vec<PaymentAllocation>> {
        self.inner.allocations(payment_id)
    }

    fn overpayment_transactions(&self, client_id: Uuid) -> Result<Vec<OverpaymentTransaction>> {
        self.inner.overpayment_transactions(client_id)
    }
}

impl LedgerTx for FaultyTx<'_> {
    fn lock_client(&mut self, id: Uuid) -> Result<Option<Client>> {
        self.inner.lock_client(id)
    }

    fn lock_loan(&mut self, id: Uuid) -> Result<Option<Loan>> {
        self.inner.lock_loan(id)
    }

    fn insert_payment(&mut self, payment: NewPayment) -> Result<NonPosted> {
        self.inner.insert_payment(payment)
    }

    fn update_payment(&mut self, payment: &NonPosted) -> Result<()> {
        self.inner.update_payment(payment)
    }

    fn insert_allocation(&mut self, allocation: NewAllocation) -> Result<PaymentAllocation> {
        self.trip(FaultPoint::InsertAllocation)?;
        self.inner.insert_allocation(allocation)
    }

    fn delete_allocations(&mut self, payment_id: Uuid, at: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_allocations(payment_id, at)
    }

    fn update_installment(&mut self, installment: &Installment) -> Result<()> {
        self.inner.update_installment(installment)
    }

    fn update_loan(&mut self, loan: &Loan) -> Result<()> {
        self.trip(FaultPoint::UpdateLoan)?;
        self.inner.update_loan(loan)
    }

    fn set_overpayment(&mut self, client_id: Uuid, balance: Money) -> Result<()> {
        self.inner.set_overpayment(client_id, balance)
    }

    fn insert_overpayment_transaction(
        &mut self,
        entry: NewOverpaymentTransaction,
    ) -> Result<OverpaymentTransaction> {
        self.inner.insert_overpayment_transaction(entry)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.trip(FaultPoint::Commit)?;
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.owner.rollbacks.fetch_add(1, Ordering::SeqCst);
        let fails = self.owner.rollback_fails.load(Ordering::SeqCst);
        self.inner.rollback()?;
        if fails {
            return Err(EngineError::store("rollback", "connection lost"));
        }
        Ok(())
    }
}
