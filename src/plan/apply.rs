use hourglass_rs::SafeTimeProvider;
use tracing::debug;

use crate::config::EngineConfig;
use crate::context::CallContext;
use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::events::{Event, EventStore};
use crate::ledger::{LedgerTx, NewAllocation};
use crate::payments::{complete_if_settled, BalanceChange, OverpaymentLedger};
use crate::state::ClientPosition;
use crate::types::{Actor, AllocationKind, InstallmentId, LoanId, LoanStatus, OverpaymentReason, PaymentId};

use super::{Action, Plan};

/// writes a plan through an open transaction
///
/// Each action is first applied to the in-memory position and the
/// resulting rows are then persisted, so the store ends up holding what
/// the position says. Allocation lines are written for posting actions
/// only; reversal moves are recorded in the overpayment log and events.
pub struct Applier<'a, T: LedgerTx + ?Sized> {
    tx: &'a mut T,
    time: &'a SafeTimeProvider,
    ctx: &'a CallContext,
    config: &'a EngineConfig,
    events: &'a mut EventStore,
    actor: Actor,
    payment_id: Option<PaymentId>,
}

impl<'a, T: LedgerTx + ?Sized> Applier<'a, T> {
    pub fn new(
        tx: &'a mut T,
        time: &'a SafeTimeProvider,
        ctx: &'a CallContext,
        config: &'a EngineConfig,
        events: &'a mut EventStore,
        actor: Actor,
    ) -> Self {
        Self {
            tx,
            time,
            ctx,
            config,
            events,
            actor,
            payment_id: None,
        }
    }

    /// tie allocation lines and log entries to this payment
    pub fn for_payment(mut self, payment_id: PaymentId) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    pub fn apply(&mut self, plan: &Plan, mut position: Option<&mut ClientPosition>) -> Result<()> {
        if let Some(blocker) = plan.blockers().next() {
            return Err(blocker.to_error());
        }

        for action in &plan.actions {
            self.ctx.checkpoint(action.step(), self.time)?;
            self.apply_action(action, position.as_deref_mut())?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: &Action, position: Option<&mut ClientPosition>) -> Result<()> {
        let now = self.time.now();
        debug!(step = action.step(), "applying action");

        if !action.touches_position() {
            return self.apply_to_payment(action);
        }
        let position = position.ok_or_else(|| {
            EngineError::invariant(format!("{} needs a client position", action.step()))
        })?;
        action.apply_to(position, now)?;

        match *action {
            Action::DebitOverpayment {
                client_id,
                amount,
                reason,
            } => {
                let description = reason_str(self.config, reason);
                let new_balance = OverpaymentLedger::debit(
                    &mut *self.tx,
                    BalanceChange {
                        client_id,
                        amount,
                        payment_id: self.payment_id,
                        description,
                        actor: &self.actor,
                        at: now,
                    },
                )?;
                expect_balance(position, new_balance)?;
                if reason != OverpaymentReason::Reversal {
                    self.record_line(None, None, AllocationKind::OverpaymentDebit, -amount, description.to_string())?;
                }
                self.events.emit(Event::OverpaymentDebited {
                    client_id,
                    amount,
                    reason,
                    new_balance,
                    timestamp: now,
                });
            }
            Action::CreditOverpayment {
                client_id,
                amount,
                reason,
            } => {
                let description = reason_str(self.config, reason);
                let new_balance = OverpaymentLedger::credit(
                    &mut *self.tx,
                    BalanceChange {
                        client_id,
                        amount,
                        payment_id: self.payment_id,
                        description,
                        actor: &self.actor,
                        at: now,
                    },
                )?;
                expect_balance(position, new_balance)?;
                if reason != OverpaymentReason::Reversal {
                    self.record_line(None, None, AllocationKind::OverpaymentCredit, amount, description.to_string())?;
                }
                self.events.emit(Event::OverpaymentCredited {
                    client_id,
                    amount,
                    reason,
                    new_balance,
                    timestamp: now,
                });
            }
            Action::SettleFee { loan_id, amount } => {
                self.persist_loan(position, loan_id)?;
                let description = self.config.descriptions.processing_fee.clone();
                self.record_line(Some(loan_id), None, AllocationKind::ProcessingFee, amount, description)?;
                self.events.emit(Event::ProcessingFeeSettled {
                    loan_id,
                    amount,
                    timestamp: now,
                });
            }
            Action::SettleInstallment {
                loan_id,
                installment_id,
                sequence,
                amount,
                fully_paid,
            } => {
                self.persist_installment(position, installment_id)?;
                self.persist_loan(position, loan_id)?;
                let description = if fully_paid {
                    self.config.descriptions.installment_full.clone()
                } else {
                    self.config.descriptions.installment_partial.clone()
                };
                self.record_line(
                    Some(loan_id),
                    Some(installment_id),
                    AllocationKind::Installment,
                    amount,
                    description,
                )?;
                self.events.emit(Event::InstallmentSettled {
                    loan_id,
                    installment_id,
                    sequence,
                    amount,
                    fully_paid,
                    timestamp: now,
                });
            }
            Action::CompleteLoan { loan_id } => {
                // the store, not the position, has the final say on what is unpaid
                let completed = complete_if_settled(&mut *self.tx, loan_id)?;
                if completed.is_none() {
                    return Err(EngineError::invariant(format!(
                        "loan {} still shows unpaid installments after allocation",
                        loan_id
                    )));
                }
                self.events.emit(Event::LoanStatusChanged {
                    loan_id,
                    old_status: LoanStatus::Active,
                    new_status: LoanStatus::Completed,
                    reason: "all installments paid".to_string(),
                    timestamp: now,
                });
            }
            Action::RevertInstallment {
                loan_id,
                installment_id,
                sequence,
                amount,
            } => {
                self.persist_installment(position, installment_id)?;
                self.persist_loan(position, loan_id)?;
                self.events.emit(Event::InstallmentReverted {
                    loan_id,
                    installment_id,
                    sequence,
                    amount,
                    timestamp: now,
                });
            }
            Action::RevertFee { loan_id, amount } => {
                self.persist_loan(position, loan_id)?;
                self.events.emit(Event::ProcessingFeeReverted {
                    loan_id,
                    amount,
                    timestamp: now,
                });
            }
            Action::ReopenLoan { loan_id } => {
                self.persist_loan(position, loan_id)?;
                self.events.emit(Event::LoanStatusChanged {
                    loan_id,
                    old_status: LoanStatus::Completed,
                    new_status: LoanStatus::Active,
                    reason: "payment reversed".to_string(),
                    timestamp: now,
                });
            }
            Action::SwitchLoan { from, to } => {
                debug!(from = %from, to = %to, "posting moves to the active loan");
            }
            Action::Blocked(blocker) => return Err(blocker.to_error()),
            Action::VoidAllocations { .. } | Action::VoidPayment { .. } | Action::ChangeAmount { .. } => {}
        }
        Ok(())
    }

    fn apply_to_payment(&mut self, action: &Action) -> Result<()> {
        let now = self.time.now();
        match *action {
            Action::VoidAllocations { payment_id, lines } => {
                let deleted = self.tx.delete_allocations(payment_id, now)?;
                if deleted != lines {
                    return Err(EngineError::invariant(format!(
                        "expected to void {} allocation lines of payment {}, found {}",
                        lines, payment_id, deleted
                    )));
                }
            }
            Action::VoidPayment { payment_id } => {
                let mut payment = self
                    .tx
                    .payment(payment_id)?
                    .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
                payment.voided_at = Some(now);
                self.tx.update_payment(&payment)?;
                self.events.emit(Event::PaymentReverted {
                    payment_id,
                    actor: self.actor.clone(),
                    timestamp: now,
                });
            }
            Action::ChangeAmount { payment_id, from, to } => {
                let mut payment = self
                    .tx
                    .payment(payment_id)?
                    .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
                payment.amount = to;
                self.tx.update_payment(&payment)?;
                self.events.emit(Event::PaymentAmended {
                    payment_id,
                    old_amount: from,
                    new_amount: to,
                    actor: self.actor.clone(),
                    timestamp: now,
                });
            }
            _ => {
                return Err(EngineError::invariant(format!(
                    "{} is not a payment-level action",
                    action.step()
                )))
            }
        }
        Ok(())
    }

    fn persist_loan(&mut self, position: &ClientPosition, loan_id: LoanId) -> Result<()> {
        let lp = position
            .loan
            .as_ref()
            .filter(|lp| lp.loan.id == loan_id)
            .ok_or_else(|| EngineError::invariant(format!("loan {} not loaded", loan_id)))?;
        self.tx.update_loan(&lp.loan)
    }

    fn persist_installment(&mut self, position: &ClientPosition, installment_id: InstallmentId) -> Result<()> {
        let lp = position
            .loan
            .as_ref()
            .ok_or_else(|| EngineError::invariant("installment change without a loan"))?;
        self.tx.update_installment(lp.installment(installment_id)?)
    }

    fn record_line(
        &mut self,
        loan_id: Option<LoanId>,
        installment_id: Option<InstallmentId>,
        kind: AllocationKind,
        amount: Money,
        description: String,
    ) -> Result<()> {
        let Some(payment_id) = self.payment_id else {
            return Ok(());
        };
        self.tx.insert_allocation(NewAllocation {
            payment_id,
            loan_id,
            installment_id,
            kind,
            amount,
            description,
            created_at: self.time.now(),
        })?;
        Ok(())
    }
}

pub(crate) fn reason_str(config: &EngineConfig, reason: OverpaymentReason) -> &str {
    let d = &config.descriptions;
    match reason {
        OverpaymentReason::NoActiveLoan => &d.no_active_loan,
        OverpaymentReason::FeeShortfall => &d.fee_shortfall,
        OverpaymentReason::Residual => &d.residual,
        OverpaymentReason::AutoConsume => &d.auto_consume,
        OverpaymentReason::Reversal => &d.reversal,
        OverpaymentReason::Manual => &d.manual,
    }
}

fn expect_balance(position: &ClientPosition, stored: Money) -> Result<()> {
    if position.overpayment != stored {
        return Err(EngineError::invariant(format!(
            "overpayment balance drifted: planned {}, stored {}",
            position.overpayment, stored
        )));
    }
    Ok(())
}
