/// fee and credit - a payment short of the processing fee is parked, then picked up
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use payment_allocation::{
    CallContext, LedgerRead, LedgerStore, LoanTerms, ManualPayment, MemoryLedger, Money,
    PaymentRouter, SafeTimeProvider, TimeSource, Uuid,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,payment_allocation=debug")
        .init();

    println!("=== fee and credit example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    ));
    let ledger = Arc::new(MemoryLedger::new());
    let client = ledger.add_client("Baraka", "254700000002", &["ACC-002"]);
    let (loan, _) = ledger.disburse_loan(
        LoanTerms::new(
            client.id,
            Money::from_major(2_000),
            4,
            NaiveDate::from_ymd_opt(2024, 6, 8).unwrap(),
        )
        .processing_fee(Money::from_major(300)),
    )?;

    let router = PaymentRouter::builder()
        .store(ledger.clone())
        .time(time.clone())
        .build()?;
    let staff = Uuid::new_v4();
    let ctx = CallContext::background();

    let pay = |amount: i64| ManualPayment {
        client_id: client.id,
        amount: Money::from_major(amount),
        staff_id: staff,
        reference: None,
        paid_at: None,
    };

    // 200 does not cover the 300 fee
    let first = router.record_manual(pay(200), &ctx)?;
    println!("first payment: {:?}", first.branch);
    println!("standing credit: {}", ledger.read()?.client(client.id)?.map(|c| c.overpayment).unwrap_or_default());

    // preview the next one before posting it
    let preview = router.preview(client.id, Money::from_major(700))?;
    println!("\npreview of 700:");
    for line in preview.summaries() {
        println!("  {}", line);
    }

    let second = router.record_manual(pay(700), &ctx)?;
    println!("\nsecond payment: {:?} ({} actions)", second.branch, second.actions.len());

    let view = ledger.read()?;
    for installment in view.installments(loan.id)? {
        println!(
            "  installment #{} due {}: remaining {}",
            installment.sequence, installment.due_date, installment.remaining
        );
    }

    let reconciliation = router.reconcile(client.id)?;
    println!("\ncredit balanced: {}", reconciliation.is_balanced());

    Ok(())
}
