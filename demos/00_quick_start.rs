/// quick start - receive one repayment and see where it went
use std::sync::Arc;

use chrono::NaiveDate;
use payment_allocation::{
    CallContext, IncomingPayment, LoanTerms, MemoryLedger, Money, PaymentRouter, TransactionSource,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,payment_allocation=debug")
        .init();

    // a client with a 3,000 loan repaid in three installments
    let ledger = Arc::new(MemoryLedger::new());
    let client = ledger.add_client("Amina", "254700000001", &["ACC-001"]);
    ledger.disburse_loan(LoanTerms::new(
        client.id,
        Money::from_major(3_000),
        3,
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    ))?;

    let router = PaymentRouter::builder().store(ledger.clone()).build()?;

    // mobile-money callback quoting the client's account
    let outcome = router.receive(
        IncomingPayment {
            external_ref: "QK81XZ09".to_string(),
            payer_account: "ACC-001".to_string(),
            payer_phone: "254700000001".to_string(),
            payer_name: "AMINA W".to_string(),
            amount: Money::from_major(2_500),
            paid_at: None,
            origin: TransactionSource::External,
        },
        &CallContext::background(),
    )?;

    println!("{}", outcome.to_json_pretty()?);

    Ok(())
}
