/// simulate revert - dry-run a reversal, then apply it
use std::sync::Arc;

use chrono::NaiveDate;
use payment_allocation::{
    CallContext, LedgerRead, LedgerStore, LoanTerms, ManualPayment, MemoryLedger, Money,
    PaymentRouter, Uuid,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("warn,payment_allocation=info")
        .init();

    let ledger = Arc::new(MemoryLedger::new());
    let client = ledger.add_client("Chebet", "254700000003", &["ACC-003"]);
    let (loan, _) = ledger.disburse_loan(LoanTerms::new(
        client.id,
        Money::from_major(1_000),
        2,
        NaiveDate::from_ymd_opt(2024, 6, 8).unwrap(),
    ))?;

    let router = PaymentRouter::builder().store(ledger.clone()).build()?;
    let staff = Uuid::new_v4();
    let ctx = CallContext::background();

    // overpay and close the loan
    let posted = router.record_manual(
        ManualPayment {
            client_id: client.id,
            amount: Money::from_major(1_200),
            staff_id: staff,
            reference: Some("COUNTER-0042".to_string()),
            paid_at: None,
        },
        &ctx,
    )?;
    println!("loan status: {:?}", ledger.read()?.loan(loan.id)?.map(|l| l.status));

    // what a reversal would do
    let simulation = router.simulate_revert(posted.payment.id)?;
    println!("\nsimulated reversal (blocked: {}):", simulation.blocked);
    for line in simulation.summaries() {
        println!("  {}", line);
    }

    let reverted = router.revert(posted.payment.id, staff, &ctx)?;
    println!("\napplied {} actions", reverted.actions.len());
    println!("loan status: {:?}", ledger.read()?.loan(loan.id)?.map(|l| l.status));
    println!("{}", simulation.to_json_pretty()?);

    Ok(())
}
