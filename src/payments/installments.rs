use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::ledger::Installment;
use crate::types::{InstallmentId, LoanId};

/// one installment touched by an allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub installment_id: InstallmentId,
    pub loan_id: LoanId,
    pub sequence: u32,
    pub due_date: NaiveDate,
    pub amount: Money,
    /// remaining balance before this settlement
    pub remaining_before: Money,
    pub fully_settled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentAllocation {
    pub settlements: Vec<Settlement>,
    pub applied: Money,
    /// pool left after every unpaid installment was cleared
    pub residual: Money,
}

/// walk unpaid installments earliest-due first
///
/// Each installment is either cleared in full, letting the walk continue,
/// or takes the whole remaining pool as a partial settlement, ending it.
pub fn allocate(installments: &[Installment], pool: Money) -> InstallmentAllocation {
    let mut unpaid: Vec<&Installment> = installments
        .iter()
        .filter(|i| !i.paid && i.remaining.is_positive())
        .collect();
    unpaid.sort_by_key(|i| (i.due_date, i.sequence));

    let mut pool = pool;
    let mut applied = Money::ZERO;
    let mut settlements = Vec::new();

    for installment in unpaid {
        if !pool.is_positive() {
            break;
        }

        let amount = pool.min(installment.remaining);
        let fully_settled = amount == installment.remaining;
        settlements.push(Settlement {
            installment_id: installment.id,
            loan_id: installment.loan_id,
            sequence: installment.sequence,
            due_date: installment.due_date,
            amount,
            remaining_before: installment.remaining,
            fully_settled,
        });
        applied += amount;
        pool -= amount;

        if !fully_settled {
            break;
        }
    }

    InstallmentAllocation {
        settlements,
        applied,
        residual: pool,
    }
}

impl InstallmentAllocation {
    /// true when every unpaid installment is fully cleared by this allocation
    pub fn clears(&self, installments: &[Installment]) -> bool {
        installments.iter().filter(|i| !i.paid).all(|i| {
            self.settlements
                .iter()
                .any(|s| s.installment_id == i.id && s.fully_settled)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn schedule(amounts: &[i64], gaps_days: &[i64]) -> Vec<Installment> {
        let loan_id = Uuid::new_v4();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        amounts
            .iter()
            .zip(gaps_days)
            .enumerate()
            .map(|(i, (amount, gap))| Installment {
                id: Uuid::new_v4(),
                loan_id,
                sequence: i as u32 + 1,
                amount_due: Money::from_major(*amount),
                remaining: Money::from_major(*amount),
                paid: false,
                paid_at: None,
                due_date: start + chrono::Duration::days(*gap),
            })
            .collect()
    }

    #[test]
    fn test_earliest_due_first_then_partial() {
        let installments = schedule(&[1000, 1000, 1000], &[10, 20, 30]);
        let result = allocate(&installments, Money::from_major(2500));

        assert_eq!(result.settlements.len(), 3);
        assert!(result.settlements[0].fully_settled);
        assert!(result.settlements[1].fully_settled);
        assert!(!result.settlements[2].fully_settled);
        assert_eq!(result.settlements[2].amount, Money::from_major(500));
        assert_eq!(result.applied, Money::from_major(2500));
        assert_eq!(result.residual, Money::ZERO);
        assert!(!result.clears(&installments));
    }

    #[test]
    fn test_due_date_beats_sequence() {
        // sequence 1 falls due after sequence 2
        let installments = schedule(&[100, 100], &[20, 10]);
        let result = allocate(&installments, Money::from_major(100));

        assert_eq!(result.settlements.len(), 1);
        assert_eq!(result.settlements[0].sequence, 2);
    }

    #[test]
    fn test_residual_after_clearing_everything() {
        let installments = schedule(&[300, 300], &[7, 14]);
        let result = allocate(&installments, Money::from_major(900));

        assert_eq!(result.applied, Money::from_major(600));
        assert_eq!(result.residual, Money::from_major(300));
        assert!(result.clears(&installments));
    }

    #[test]
    fn test_paid_installments_are_skipped() {
        let mut installments = schedule(&[200, 200], &[7, 14]);
        installments[0].remaining = Money::ZERO;
        installments[0].paid = true;

        let result = allocate(&installments, Money::from_major(50));
        assert_eq!(result.settlements[0].sequence, 2);
        assert_eq!(result.settlements[0].remaining_before, Money::from_major(200));
    }

    #[test]
    fn test_empty_pool_touches_nothing() {
        let installments = schedule(&[200], &[7]);
        let result = allocate(&installments, Money::ZERO);
        assert!(result.settlements.is_empty());
        assert_eq!(result.residual, Money::ZERO);
    }
}
