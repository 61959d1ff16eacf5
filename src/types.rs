use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type ClientId = Uuid;
pub type LoanId = Uuid;
pub type ProductId = Uuid;
pub type InstallmentId = Uuid;
pub type PaymentId = Uuid;
pub type AllocationId = Uuid;
pub type StaffId = Uuid;

/// loan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatus {
    /// approved but not disbursed
    Inactive,
    /// disbursed and accepting repayments
    Active,
    /// every installment settled
    Completed,
    Defaulted,
}

/// where an incoming payment originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSource {
    /// mobile-money network callback
    External,
    /// entered inside our own app
    Internal,
}

/// what an allocation line was applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    Installment,
    ProcessingFee,
    /// money parked as standing credit
    OverpaymentCredit,
    /// standing credit pulled into the pool (negative line)
    OverpaymentDebit,
}

/// why the standing credit moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverpaymentReason {
    NoActiveLoan,
    FeeShortfall,
    Residual,
    AutoConsume,
    Reversal,
    Manual,
}

/// who performed a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    System(String),
    Staff(StaffId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System(label) => write!(f, "{}", label),
            Actor::Staff(id) => write!(f, "staff:{}", id),
        }
    }
}
