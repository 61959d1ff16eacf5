pub mod config;
pub mod context;
pub mod decimal;
pub mod errors;
pub mod events;
pub mod gate;
pub mod ledger;
pub mod payments;
pub mod plan;
pub mod router;
pub mod schedule;
pub mod state;
pub mod types;

// re-export key types
pub use config::{AllocationDescriptions, DuplicateReferencePolicy, EngineConfig};
pub use context::{CallContext, CancelHandle};
pub use decimal::Money;
pub use errors::{EngineError, ErrorKind, Result};
pub use events::{Event, EventStore};
pub use ledger::{
    Client, Installment, LedgerRead, LedgerStore, LedgerTx, Loan, LoanTerms, MemoryLedger,
    NonPosted, OverpaymentTransaction, PaymentAllocation,
};
pub use payments::{
    AssignmentRequest, IncomingPayment, ManualPayment, OverpaymentAdjustment, Reconciliation,
};
pub use plan::{Action, Blocker, Branch, Intent, Plan, Simulation};
pub use router::{BalanceOutcome, PaymentOutcome, PaymentRouter, PaymentRouterBuilder};
pub use state::{ClientPosition, LoanPosition, LoanTarget};
pub use types::{
    Actor, AllocationKind, ClientId, InstallmentId, LoanId, LoanStatus, OverpaymentReason,
    PaymentId, StaffId, TransactionSource,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
