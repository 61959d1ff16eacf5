use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::ledger::{LedgerRead, LedgerTx, NewOverpaymentTransaction};
use crate::types::{Actor, ClientId, PaymentId};

/// a single change to a client's standing credit
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange<'a> {
    pub client_id: ClientId,
    /// always positive; direction comes from credit or debit
    pub amount: Money,
    pub payment_id: Option<PaymentId>,
    pub description: &'a str,
    pub actor: &'a Actor,
    pub at: DateTime<Utc>,
}

/// balance and audit log agreement for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub balance: Money,
    pub logged: Money,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.balance == self.logged
    }
}

/// standing credit writes
///
/// Every balance change is paired with a signed audit entry inside the
/// same transaction; the balance never goes below zero.
pub struct OverpaymentLedger;

impl OverpaymentLedger {
    /// add to the balance; returns the new balance
    pub fn credit<T: LedgerTx + ?Sized>(tx: &mut T, change: BalanceChange<'_>) -> Result<Money> {
        validate(&change)?;
        let balance = current_balance(tx, change.client_id)?;
        let new_balance = balance + change.amount;

        tx.set_overpayment(change.client_id, new_balance)?;
        tx.insert_overpayment_transaction(entry(&change, change.amount))?;
        Ok(new_balance)
    }

    /// take from the balance; fails if the balance cannot cover it
    pub fn debit<T: LedgerTx + ?Sized>(tx: &mut T, change: BalanceChange<'_>) -> Result<Money> {
        validate(&change)?;
        let balance = current_balance(tx, change.client_id)?;
        if balance < change.amount {
            return Err(EngineError::InsufficientOverpayment {
                available: balance,
                requested: change.amount,
            });
        }
        let new_balance = balance - change.amount;

        tx.set_overpayment(change.client_id, new_balance)?;
        tx.insert_overpayment_transaction(entry(&change, -change.amount))?;
        Ok(new_balance)
    }

    /// compare the balance with the signed sum of its audit entries
    pub fn reconcile<R: LedgerRead + ?Sized>(reader: &R, client_id: ClientId) -> Result<Reconciliation> {
        let client = reader
            .client(client_id)?
            .ok_or(EngineError::ClientNotFound {
                reference: client_id.to_string(),
            })?;
        let logged = reader
            .overpayment_transactions(client_id)?
            .iter()
            .map(|t| t.amount)
            .sum();

        Ok(Reconciliation {
            balance: client.overpayment,
            logged,
        })
    }
}

fn validate(change: &BalanceChange<'_>) -> Result<()> {
    if !change.amount.is_positive() {
        return Err(EngineError::InvalidPaymentAmount {
            amount: change.amount,
        });
    }
    Ok(())
}

fn current_balance<T: LedgerTx + ?Sized>(tx: &mut T, client_id: ClientId) -> Result<Money> {
    let client = tx
        .lock_client(client_id)?
        .ok_or(EngineError::ClientNotFound {
            reference: client_id.to_string(),
        })?;
    Ok(client.overpayment)
}

fn entry(change: &BalanceChange<'_>, signed: Money) -> NewOverpaymentTransaction {
    NewOverpaymentTransaction {
        client_id: change.client_id,
        payment_id: change.payment_id,
        amount: signed,
        description: change.description.to_string(),
        actor: change.actor.clone(),
        created_at: change.at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerStore, MemoryLedger};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_credit_then_debit_keeps_log_in_step() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Imani", "254744000001", &[]);
        let actor = Actor::System("system".to_string());

        let mut tx = ledger.begin().unwrap();
        let balance = OverpaymentLedger::credit(
            tx.as_mut(),
            BalanceChange {
                client_id: client.id,
                amount: Money::from_major(500),
                payment_id: None,
                description: "overpayment: no active loan",
                actor: &actor,
                at: at(),
            },
        )
        .unwrap();
        assert_eq!(balance, Money::from_major(500));

        let balance = OverpaymentLedger::debit(
            tx.as_mut(),
            BalanceChange {
                client_id: client.id,
                amount: Money::from_major(120),
                payment_id: None,
                description: "overpayment applied to loan",
                actor: &actor,
                at: at(),
            },
        )
        .unwrap();
        assert_eq!(balance, Money::from_major(380));
        tx.commit().unwrap();

        let view = ledger.read().unwrap();
        let reconciliation = OverpaymentLedger::reconcile(&*view, client.id).unwrap();
        assert!(reconciliation.is_balanced());
        assert_eq!(reconciliation.balance, Money::from_major(380));

        let log = view.overpayment_transactions(client.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].amount, Money::from_major(-120));
    }

    #[test]
    fn test_debit_cannot_overdraw() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Juma", "254744000002", &[]);
        ledger.seed_overpayment(client.id, Money::from_major(100), at()).unwrap();
        let actor = Actor::System("system".to_string());

        let mut tx = ledger.begin().unwrap();
        let err = OverpaymentLedger::debit(
            tx.as_mut(),
            BalanceChange {
                client_id: client.id,
                amount: Money::from_major(150),
                payment_id: None,
                description: "manual",
                actor: &actor,
                at: at(),
            },
        )
        .unwrap_err();
        tx.rollback().unwrap();

        assert!(matches!(err, EngineError::InsufficientOverpayment { .. }));
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let ledger = MemoryLedger::new();
        let client = ledger.add_client("Wairimu", "254744000003", &[]);
        let actor = Actor::System("system".to_string());

        let mut tx = ledger.begin().unwrap();
        let err = OverpaymentLedger::credit(
            tx.as_mut(),
            BalanceChange {
                client_id: client.id,
                amount: Money::ZERO,
                payment_id: None,
                description: "nothing",
                actor: &actor,
                at: at(),
            },
        )
        .unwrap_err();
        tx.rollback().unwrap();

        assert!(matches!(err, EngineError::InvalidPaymentAmount { .. }));
    }
}
