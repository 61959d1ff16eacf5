use thiserror::Error;
use uuid::Uuid;

use crate::decimal::Money;
use crate::types::{ClientId, LoanId, PaymentId, TransactionSource};

/// coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Internal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no client matches account reference {reference}")]
    ClientNotFound {
        reference: String,
    },

    #[error("no active loan for client {client_id}")]
    NoActiveLoan {
        client_id: ClientId,
    },

    #[error("payment not found: {id}")]
    PaymentNotFound {
        id: PaymentId,
    },

    #[error("loan not found: {id}")]
    LoanNotFound {
        id: LoanId,
    },

    #[error("installment not found: {id}")]
    InstallmentNotFound {
        id: Uuid,
    },

    #[error("invalid payment amount: {amount}")]
    InvalidPaymentAmount {
        amount: Money,
    },

    #[error("payment {id} has origin {origin:?}; only internal payments can be edited or deleted")]
    NotInternalSource {
        id: PaymentId,
        origin: TransactionSource,
    },

    #[error("payment {id} is already assigned to client {client_id}")]
    AlreadyAssigned {
        id: PaymentId,
        client_id: ClientId,
    },

    #[error("payment {id} has been voided")]
    PaymentVoided {
        id: PaymentId,
    },

    #[error("payment {id} has no client attribution")]
    Unattributed {
        id: PaymentId,
    },

    #[error("duplicate external reference: {reference}")]
    DuplicateReference {
        reference: String,
    },

    #[error("insufficient overpayment: available {available}, requested {requested}")]
    InsufficientOverpayment {
        available: Money,
        requested: Money,
    },

    #[error("loan {loan_id} cannot return to active: client already holds active loan {active_loan_id}")]
    ReactivationBlocked {
        loan_id: LoanId,
        active_loan_id: LoanId,
    },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
    },

    #[error("ledger invariant violated: {message}")]
    LedgerInvariant {
        message: String,
    },

    #[error("store failure during {step}: {message}")]
    Store {
        step: &'static str,
        message: String,
    },

    #[error("cancelled during {step}")]
    Cancelled {
        step: &'static str,
    },

    #[error("deadline exceeded during {step}")]
    DeadlineExceeded {
        step: &'static str,
    },

    #[error("{source}; rollback failed: {rollback}")]
    RollbackFailed {
        source: Box<EngineError>,
        rollback: Box<EngineError>,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ClientNotFound { .. }
            | EngineError::NoActiveLoan { .. }
            | EngineError::PaymentNotFound { .. }
            | EngineError::LoanNotFound { .. }
            | EngineError::InstallmentNotFound { .. } => ErrorKind::NotFound,

            EngineError::InvalidPaymentAmount { .. }
            | EngineError::NotInternalSource { .. }
            | EngineError::AlreadyAssigned { .. }
            | EngineError::PaymentVoided { .. }
            | EngineError::Unattributed { .. }
            | EngineError::DuplicateReference { .. }
            | EngineError::InsufficientOverpayment { .. }
            | EngineError::ReactivationBlocked { .. }
            | EngineError::InvalidConfiguration { .. } => ErrorKind::Invalid,

            EngineError::LedgerInvariant { .. }
            | EngineError::Store { .. }
            | EngineError::Cancelled { .. }
            | EngineError::DeadlineExceeded { .. }
            | EngineError::RollbackFailed { .. } => ErrorKind::Internal,
        }
    }

    /// safe to replay the same request after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store { .. }
                | EngineError::Cancelled { .. }
                | EngineError::DeadlineExceeded { .. }
        )
    }

    pub fn store(step: &'static str, message: impl Into<String>) -> Self {
        EngineError::Store {
            step,
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::LedgerInvariant {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let not_found = EngineError::NoActiveLoan { client_id: Uuid::new_v4() };
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let invalid = EngineError::InsufficientOverpayment {
            available: Money::from_major(10),
            requested: Money::from_major(20),
        };
        assert_eq!(invalid.kind(), ErrorKind::Invalid);
        assert!(!invalid.is_retryable());

        let store = EngineError::store("insert allocation", "disk full");
        assert_eq!(store.kind(), ErrorKind::Internal);
        assert!(store.is_retryable());
        assert_eq!(store.to_string(), "store failure during insert allocation: disk full");
    }

    #[test]
    fn test_rollback_failure_carries_both_errors() {
        let err = EngineError::RollbackFailed {
            source: Box::new(EngineError::store("update loan", "connection reset")),
            rollback: Box::new(EngineError::store("rollback", "connection reset")),
        };

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("update loan"));
        assert!(message.contains("rollback failed"));
    }
}
