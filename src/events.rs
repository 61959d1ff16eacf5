use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{
    Actor, ClientId, InstallmentId, LoanId, LoanStatus, OverpaymentReason, PaymentId,
    TransactionSource,
};

/// all events the engine can emit
///
/// Events are collected during a unit of work and handed to the caller
/// only once it has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // intake events
    PaymentReceived {
        payment_id: PaymentId,
        source: TransactionSource,
        amount: Money,
        client_id: Option<ClientId>,
        timestamp: DateTime<Utc>,
    },
    PaymentAssigned {
        payment_id: PaymentId,
        client_id: ClientId,
        actor: Actor,
        timestamp: DateTime<Utc>,
    },

    // allocation events
    ProcessingFeeSettled {
        loan_id: LoanId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    InstallmentSettled {
        loan_id: LoanId,
        installment_id: InstallmentId,
        sequence: u32,
        amount: Money,
        fully_paid: bool,
        timestamp: DateTime<Utc>,
    },
    OverpaymentCredited {
        client_id: ClientId,
        amount: Money,
        reason: OverpaymentReason,
        new_balance: Money,
        timestamp: DateTime<Utc>,
    },
    OverpaymentDebited {
        client_id: ClientId,
        amount: Money,
        reason: OverpaymentReason,
        new_balance: Money,
        timestamp: DateTime<Utc>,
    },

    // reversal events
    InstallmentReverted {
        loan_id: LoanId,
        installment_id: InstallmentId,
        sequence: u32,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    ProcessingFeeReverted {
        loan_id: LoanId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    PaymentReverted {
        payment_id: PaymentId,
        actor: Actor,
        timestamp: DateTime<Utc>,
    },
    PaymentAmended {
        payment_id: PaymentId,
        old_amount: Money,
        new_amount: Money,
        actor: Actor,
        timestamp: DateTime<Utc>,
    },

    // status change events
    LoanStatusChanged {
        loan_id: LoanId,
        old_status: LoanStatus,
        new_status: LoanStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// event store for collecting events during operations
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }
}
