pub mod fee;
pub mod installments;
pub mod overpayment;
pub mod resolver;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::types::{ClientId, PaymentId, StaffId, TransactionSource};

pub use fee::{settle_fee, FeeDecision};
pub use installments::{allocate, InstallmentAllocation, Settlement};
pub use overpayment::{BalanceChange, OverpaymentLedger, Reconciliation};
pub use resolver::resolve_active_loan;
pub use status::complete_if_settled;

/// a payment as reported by a provider callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingPayment {
    pub external_ref: String,
    /// account reference quoted by the payer
    pub payer_account: String,
    pub payer_phone: String,
    pub payer_name: String,
    pub amount: Money,
    /// provider timestamp; the engine clock is used when absent
    pub paid_at: Option<DateTime<Utc>>,
    pub origin: TransactionSource,
}

/// staff attaching an unattributed payment to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub payment_id: PaymentId,
    pub client_id: ClientId,
    pub staff_id: StaffId,
}

/// a payment keyed in by staff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPayment {
    pub client_id: ClientId,
    pub amount: Money,
    pub staff_id: StaffId,
    pub reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// staff change to a client's standing credit outside any payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverpaymentAdjustment {
    pub client_id: ClientId,
    pub amount: Money,
    pub staff_id: StaffId,
    /// recorded on the audit entry; the configured default when absent
    pub note: Option<String>,
}

/// positive amounts only
pub fn validate_amount(amount: Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidPaymentAmount { amount });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_validation() {
        assert!(validate_amount(Money::from_major(1)).is_ok());
        assert!(validate_amount(Money::CENT).is_ok());
        assert!(validate_amount(Money::ZERO).is_err());
        assert!(validate_amount(Money::from_major(-5)).is_err());
    }

    #[test]
    fn test_incoming_payment_from_json() {
        let incoming: IncomingPayment = serde_json::from_str(
            r#"{
                "external_ref": "SBK41XQ2",
                "payer_account": "ACC-17",
                "payer_phone": "254700111222",
                "payer_name": "Faith",
                "amount": "1250.00",
                "paid_at": null,
                "origin": "External"
            }"#,
        )
        .unwrap();

        assert_eq!(incoming.amount, Money::from_major(1250));
        assert_eq!(incoming.origin, TransactionSource::External);
    }
}
