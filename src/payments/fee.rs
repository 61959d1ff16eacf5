use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::ledger::Loan;

/// outcome of checking the processing fee against a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeDecision {
    /// nothing owed; the whole pool moves on to installments
    AlreadyPaid { pool: Money },
    /// fee retired from the pool; `pool` is what is left
    Settled { fee: Money, pool: Money },
    /// pool cannot cover the fee; nothing may reach installments
    Shortfall { fee: Money, pool: Money },
}

impl FeeDecision {
    /// money still available for installments
    pub fn pool(&self) -> Money {
        match self {
            FeeDecision::AlreadyPaid { pool } | FeeDecision::Settled { pool, .. } => *pool,
            FeeDecision::Shortfall { .. } => Money::ZERO,
        }
    }

    pub fn is_shortfall(&self) -> bool {
        matches!(self, FeeDecision::Shortfall { .. })
    }
}

/// the fee is all-or-nothing: settled in full from the pool or not at all
pub fn settle_fee(loan: &Loan, pool: Money) -> FeeDecision {
    if loan.fee_paid || loan.processing_fee.is_zero() {
        return FeeDecision::AlreadyPaid { pool };
    }

    let fee = loan.processing_fee;
    if pool < fee {
        FeeDecision::Shortfall { fee, pool }
    } else {
        FeeDecision::Settled {
            fee,
            pool: pool - fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoanStatus;
    use uuid::Uuid;

    fn loan(fee: i64, fee_paid: bool) -> Loan {
        Loan {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            total_installments: 4,
            installment_period_days: 7,
            processing_fee: Money::from_major(fee),
            fee_paid,
            paid_amount: Money::ZERO,
            status: LoanStatus::Active,
        }
    }

    #[test]
    fn test_fee_already_paid() {
        let decision = settle_fee(&loan(300, true), Money::from_major(200));
        assert_eq!(decision, FeeDecision::AlreadyPaid { pool: Money::from_major(200) });
        assert_eq!(decision.pool(), Money::from_major(200));
    }

    #[test]
    fn test_fee_settled_from_pool() {
        let decision = settle_fee(&loan(300, false), Money::from_major(1000));
        assert_eq!(
            decision,
            FeeDecision::Settled {
                fee: Money::from_major(300),
                pool: Money::from_major(700),
            }
        );
    }

    #[test]
    fn test_exact_fee_leaves_empty_pool() {
        let decision = settle_fee(&loan(300, false), Money::from_major(300));
        assert!(!decision.is_shortfall());
        assert_eq!(decision.pool(), Money::ZERO);
    }

    #[test]
    fn test_fee_shortfall() {
        let decision = settle_fee(&loan(300, false), Money::from_major(200));
        assert!(decision.is_shortfall());
        assert_eq!(decision.pool(), Money::ZERO);
    }

    #[test]
    fn test_zero_fee_counts_as_paid() {
        let decision = settle_fee(&loan(0, false), Money::from_major(50));
        assert_eq!(decision, FeeDecision::AlreadyPaid { pool: Money::from_major(50) });
    }
}
