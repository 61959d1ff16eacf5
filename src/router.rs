use std::sync::Arc;

use hourglass_rs::{SafeTimeProvider, TimeSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Span};
use uuid::Uuid;

use crate::config::{DuplicateReferencePolicy, EngineConfig};
use crate::context::CallContext;
use crate::decimal::Money;
use crate::errors::{EngineError, Result};
use crate::events::{Event, EventStore};
use crate::gate::ClientGate;
use crate::ledger::{LedgerRead, LedgerStore, LedgerTx, NewPayment, NonPosted};
use crate::payments::{
    validate_amount, AssignmentRequest, BalanceChange, IncomingPayment, ManualPayment,
    OverpaymentAdjustment, OverpaymentLedger, Reconciliation,
};
use crate::plan::{
    ensure_editable, narrate, plan_amendment, plan_posting, plan_reversal, reversal_target, Action,
    Applier, Branch, Plan, Simulation,
};
use crate::state::{ClientPosition, LoanTarget};
use crate::types::{Actor, ClientId, LoanId, OverpaymentReason, PaymentId, StaffId, TransactionSource};

/// what a committed payment operation did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment: NonPosted,
    pub branch: Branch,
    /// loan the payment was settled against; `None` when it went to credit only
    pub loan_id: Option<LoanId>,
    pub actions: Vec<Action>,
    /// domain events, released only after commit
    pub events: Vec<Event>,
}

impl PaymentOutcome {
    fn from_plan(payment: NonPosted, plan: Plan, events: Vec<Event>) -> Self {
        Self {
            payment,
            branch: plan.branch,
            loan_id: plan.loan_id,
            actions: plan.actions,
            events,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.branch == Branch::Duplicate
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Store {
            step: "serialize outcome",
            message: e.to_string(),
        })
    }
}

/// result of a manual standing-credit adjustment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOutcome {
    pub client_id: ClientId,
    pub balance: Money,
    pub events: Vec<Event>,
}

/// routes payments onto loans, fees and standing credit
///
/// Every mutating call runs as one ledger transaction behind a per-client
/// gate. Dry runs use the same planner and never open a transaction.
pub struct PaymentRouter {
    store: Arc<dyn LedgerStore>,
    time: SafeTimeProvider,
    config: EngineConfig,
    span: Span,
    gate: ClientGate,
}

impl PaymentRouter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        time: SafeTimeProvider,
        config: EngineConfig,
        span: Span,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            time,
            config,
            span,
            gate: ClientGate::new(),
        })
    }

    pub fn builder() -> PaymentRouterBuilder {
        PaymentRouterBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn time(&self) -> &SafeTimeProvider {
        &self.time
    }

    /// provider callback: record the payment and allocate it when the payer is known
    pub fn receive(&self, incoming: IncomingPayment, ctx: &CallContext) -> Result<PaymentOutcome> {
        let span = info_span!(
            parent: &self.span,
            "receive",
            reference = %incoming.external_ref,
            amount = %incoming.amount,
        );
        let _entered = span.enter();
        validate_amount(incoming.amount)?;
        let ctx = self.bounded(ctx);

        if let Some(existing) = self.store.read()?.payment_by_reference(&incoming.external_ref)? {
            return self.on_duplicate(existing);
        }

        let reference = incoming.external_ref.clone();
        match self.ingest(incoming, &ctx) {
            Err(EngineError::DuplicateReference { .. })
                if self.config.duplicate_reference == DuplicateReferencePolicy::Acknowledge =>
            {
                // lost a race with a concurrent delivery of the same reference
                let existing = self
                    .store
                    .read()?
                    .payment_by_reference(&reference)?
                    .ok_or(EngineError::DuplicateReference { reference })?;
                self.on_duplicate(existing)
            }
            other => other,
        }
    }

    fn ingest(&self, incoming: IncomingPayment, ctx: &CallContext) -> Result<PaymentOutcome> {
        let client = {
            let view = self.store.read()?;
            match view.client_by_reference(&incoming.payer_account)? {
                Some(client) => Some(client),
                None => view.client_by_reference(&incoming.payer_phone)?,
            }
        };

        let new_payment = NewPayment {
            source: incoming.origin,
            external_ref: incoming.external_ref,
            payer_account: incoming.payer_account,
            payer_phone: incoming.payer_phone,
            payer_name: incoming.payer_name,
            amount: incoming.amount,
            paid_at: incoming.paid_at.unwrap_or_else(|| self.time.now()),
            client_id: client.as_ref().map(|c| c.id),
            assigned_by: None,
            assigned_at: None,
        };

        let Some(client) = client else {
            info!(
                payer_account = new_payment.payer_account.as_str(),
                "payer not matched, recording unattributed payment"
            );
            let (payment, events) = self.run(ctx, |tx, events| {
                let payment = tx.insert_payment(new_payment)?;
                events.emit(self.received(&payment));
                Ok(payment)
            })?;
            return Ok(PaymentOutcome::from_plan(payment, Plan::unattributed(), events));
        };

        let _permit = self.gate.enter(client.id);
        let ((payment, plan), events) = self.run(ctx, |tx, events| {
            let payment = tx.insert_payment(new_payment)?;
            events.emit(self.received(&payment));
            let plan = self.post(tx, events, ctx, &payment, self.config.system())?;
            Ok((payment, plan))
        })?;

        info!(
            payment_id = %payment.id,
            client_id = %client.id,
            branch = ?plan.branch,
            "payment posted"
        );
        Ok(PaymentOutcome::from_plan(payment, plan, events))
    }

    fn on_duplicate(&self, existing: NonPosted) -> Result<PaymentOutcome> {
        match self.config.duplicate_reference {
            DuplicateReferencePolicy::Reject => {
                warn!(payment_id = %existing.id, "duplicate reference rejected");
                Err(EngineError::DuplicateReference {
                    reference: existing.external_ref,
                })
            }
            DuplicateReferencePolicy::Acknowledge => {
                let allocations = self.store.read()?.allocations(existing.id)?;
                info!(payment_id = %existing.id, "duplicate delivery acknowledged");
                Ok(PaymentOutcome {
                    loan_id: allocations.iter().find_map(|a| a.loan_id),
                    payment: existing,
                    branch: Branch::Duplicate,
                    actions: Vec::new(),
                    events: Vec::new(),
                })
            }
        }
    }

    /// staff attach an unattributed payment to a client, then allocate it
    pub fn assign(&self, request: AssignmentRequest, ctx: &CallContext) -> Result<PaymentOutcome> {
        let span = info_span!(
            parent: &self.span,
            "assign",
            payment_id = %request.payment_id,
            client_id = %request.client_id,
        );
        let _entered = span.enter();
        let ctx = self.bounded(ctx);
        let actor = Actor::Staff(request.staff_id);

        let _permit = self.gate.enter(request.client_id);
        let ((payment, plan), events) = self.run(&ctx, |tx, events| {
            let mut payment = tx
                .payment(request.payment_id)?
                .ok_or(EngineError::PaymentNotFound {
                    id: request.payment_id,
                })?;
            if payment.voided_at.is_some() {
                return Err(EngineError::PaymentVoided { id: payment.id });
            }
            if let Some(client_id) = payment.client_id {
                return Err(EngineError::AlreadyAssigned {
                    id: payment.id,
                    client_id,
                });
            }
            tx.lock_client(request.client_id)?
                .ok_or(EngineError::ClientNotFound {
                    reference: request.client_id.to_string(),
                })?;

            let now = self.time.now();
            payment.client_id = Some(request.client_id);
            payment.assigned_by = Some(request.staff_id);
            payment.assigned_at = Some(now);
            tx.update_payment(&payment)?;
            events.emit(Event::PaymentAssigned {
                payment_id: payment.id,
                client_id: request.client_id,
                actor: actor.clone(),
                timestamp: now,
            });

            let plan = self.post(tx, events, &ctx, &payment, actor.clone())?;
            Ok((payment, plan))
        })?;

        info!(branch = ?plan.branch, "assigned payment posted");
        Ok(PaymentOutcome::from_plan(payment, plan, events))
    }

    /// staff-entered payment for a known client
    pub fn record_manual(&self, request: ManualPayment, ctx: &CallContext) -> Result<PaymentOutcome> {
        let span = info_span!(
            parent: &self.span,
            "record_manual",
            client_id = %request.client_id,
            amount = %request.amount,
        );
        let _entered = span.enter();
        validate_amount(request.amount)?;
        let ctx = self.bounded(ctx);
        let actor = Actor::Staff(request.staff_id);

        let _permit = self.gate.enter(request.client_id);
        let ((payment, plan), events) = self.run(&ctx, |tx, events| {
            let client = tx
                .lock_client(request.client_id)?
                .ok_or(EngineError::ClientNotFound {
                    reference: request.client_id.to_string(),
                })?;
            let now = self.time.now();
            let payment = tx.insert_payment(NewPayment {
                source: TransactionSource::Internal,
                external_ref: request
                    .reference
                    .clone()
                    .unwrap_or_else(|| format!("MANUAL-{}", Uuid::new_v4().simple())),
                payer_account: client
                    .account_refs
                    .first()
                    .cloned()
                    .unwrap_or_else(|| client.phone.clone()),
                payer_phone: client.phone.clone(),
                payer_name: client.name.clone(),
                amount: request.amount,
                paid_at: request.paid_at.unwrap_or(now),
                client_id: Some(client.id),
                assigned_by: Some(request.staff_id),
                assigned_at: Some(now),
            })?;
            events.emit(self.received(&payment));

            let plan = self.post(tx, events, &ctx, &payment, actor.clone())?;
            Ok((payment, plan))
        })?;

        info!(payment_id = %payment.id, branch = ?plan.branch, "manual payment posted");
        Ok(PaymentOutcome::from_plan(payment, plan, events))
    }

    /// delete an internal payment, undoing everything it allocated
    pub fn revert(&self, payment_id: PaymentId, staff_id: StaffId, ctx: &CallContext) -> Result<PaymentOutcome> {
        let span = info_span!(parent: &self.span, "revert", payment_id = %payment_id);
        let _entered = span.enter();
        self.edit(payment_id, staff_id, ctx, None)
    }

    /// change the amount of an internal payment and allocate it again
    pub fn amend(
        &self,
        payment_id: PaymentId,
        new_amount: Money,
        staff_id: StaffId,
        ctx: &CallContext,
    ) -> Result<PaymentOutcome> {
        let span = info_span!(
            parent: &self.span,
            "amend",
            payment_id = %payment_id,
            new_amount = %new_amount,
        );
        let _entered = span.enter();
        validate_amount(new_amount)?;
        self.edit(payment_id, staff_id, ctx, Some(new_amount))
    }

    fn edit(
        &self,
        payment_id: PaymentId,
        staff_id: StaffId,
        ctx: &CallContext,
        new_amount: Option<Money>,
    ) -> Result<PaymentOutcome> {
        let ctx = self.bounded(ctx);
        let actor = Actor::Staff(staff_id);

        let snapshot = self
            .store
            .read()?
            .payment(payment_id)?
            .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
        ensure_editable(&snapshot)?;

        let _permit = snapshot.client_id.map(|client_id| self.gate.enter(client_id));
        let ((payment, plan), events) = self.run(&ctx, |tx, events| {
            let payment = tx
                .payment(payment_id)?
                .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
            let allocations = tx.allocations(payment_id)?;
            let mut position = match payment.client_id {
                Some(client_id) => Some(ClientPosition::lock(
                    &mut *tx,
                    client_id,
                    reversal_target(&allocations),
                )?),
                None => None,
            };

            let plan = match new_amount {
                Some(amount) => plan_amendment(position.as_ref(), &payment, &allocations, amount)?,
                None => plan_reversal(position.as_ref(), &payment, &allocations)?,
            };
            if let Some(blocker) = plan.blockers().next() {
                warn!(blocker = ?blocker, "edit refused");
            }
            debug!(branch = ?plan.branch, actions = plan.actions.len(), "planned edit");

            Applier::new(&mut *tx, &self.time, &ctx, &self.config, events, actor.clone())
                .for_payment(payment_id)
                .apply(&plan, position.as_mut())?;

            let payment = tx
                .payment(payment_id)?
                .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
            Ok((payment, plan))
        })?;

        info!(branch = ?plan.branch, actions = plan.actions.len(), "payment edited");
        Ok(PaymentOutcome::from_plan(payment, plan, events))
    }

    /// what `revert` would do, without writing anything
    pub fn simulate_revert(&self, payment_id: PaymentId) -> Result<Simulation> {
        let span = info_span!(parent: &self.span, "simulate_revert", payment_id = %payment_id);
        let _entered = span.enter();
        self.simulate_edit(payment_id, None)
    }

    /// what `amend` would do, without writing anything
    pub fn simulate_amend(&self, payment_id: PaymentId, new_amount: Money) -> Result<Simulation> {
        let span = info_span!(
            parent: &self.span,
            "simulate_amend",
            payment_id = %payment_id,
            new_amount = %new_amount,
        );
        let _entered = span.enter();
        validate_amount(new_amount)?;
        self.simulate_edit(payment_id, Some(new_amount))
    }

    fn simulate_edit(&self, payment_id: PaymentId, new_amount: Option<Money>) -> Result<Simulation> {
        let view = self.store.read()?;
        let payment = view
            .payment(payment_id)?
            .ok_or(EngineError::PaymentNotFound { id: payment_id })?;
        let allocations = view.allocations(payment_id)?;
        let position = payment
            .client_id
            .map(|client_id| ClientPosition::read(&*view, client_id, reversal_target(&allocations)))
            .transpose()?;

        let plan = match new_amount {
            Some(amount) => plan_amendment(position.as_ref(), &payment, &allocations, amount)?,
            None => plan_reversal(position.as_ref(), &payment, &allocations)?,
        };
        let simulation = narrate(&plan, position.as_ref(), self.time.now());
        debug!(intents = simulation.intents.len(), blocked = simulation.blocked, "simulated edit");
        Ok(simulation)
    }

    /// where a payment of `amount` from this client would go right now
    pub fn preview(&self, client_id: ClientId, amount: Money) -> Result<Simulation> {
        let span = info_span!(parent: &self.span, "preview", client_id = %client_id, amount = %amount);
        let _entered = span.enter();

        let view = self.store.read()?;
        let position = ClientPosition::read(&*view, client_id, LoanTarget::Active)?;
        let plan = plan_posting(&position, amount)?;
        Ok(narrate(&plan, Some(&position), self.time.now()))
    }

    /// add standing credit by hand
    pub fn credit_overpayment(&self, adjustment: OverpaymentAdjustment, ctx: &CallContext) -> Result<BalanceOutcome> {
        self.adjust_overpayment(adjustment, ctx, true)
    }

    /// remove standing credit by hand; fails when the balance is short
    pub fn debit_overpayment(&self, adjustment: OverpaymentAdjustment, ctx: &CallContext) -> Result<BalanceOutcome> {
        self.adjust_overpayment(adjustment, ctx, false)
    }

    fn adjust_overpayment(
        &self,
        adjustment: OverpaymentAdjustment,
        ctx: &CallContext,
        credit: bool,
    ) -> Result<BalanceOutcome> {
        let span = info_span!(
            parent: &self.span,
            "adjust_overpayment",
            client_id = %adjustment.client_id,
            amount = %adjustment.amount,
            credit,
        );
        let _entered = span.enter();
        validate_amount(adjustment.amount)?;
        let ctx = self.bounded(ctx);
        let actor = Actor::Staff(adjustment.staff_id);
        let description = adjustment
            .note
            .clone()
            .unwrap_or_else(|| self.config.descriptions.manual.clone());

        let _permit = self.gate.enter(adjustment.client_id);
        let (balance, events) = self.run(&ctx, |tx, events| {
            let now = self.time.now();
            let change = BalanceChange {
                client_id: adjustment.client_id,
                amount: adjustment.amount,
                payment_id: None,
                description: &description,
                actor: &actor,
                at: now,
            };
            let new_balance = if credit {
                OverpaymentLedger::credit(&mut *tx, change)?
            } else {
                OverpaymentLedger::debit(&mut *tx, change)?
            };

            let (client_id, amount, reason) =
                (adjustment.client_id, adjustment.amount, OverpaymentReason::Manual);
            events.emit(if credit {
                Event::OverpaymentCredited {
                    client_id,
                    amount,
                    reason,
                    new_balance,
                    timestamp: now,
                }
            } else {
                Event::OverpaymentDebited {
                    client_id,
                    amount,
                    reason,
                    new_balance,
                    timestamp: now,
                }
            });
            Ok(new_balance)
        })?;

        info!(balance = %balance, "overpayment adjusted");
        Ok(BalanceOutcome {
            client_id: adjustment.client_id,
            balance,
            events,
        })
    }

    /// standing credit and the signed sum of its audit entries
    pub fn reconcile(&self, client_id: ClientId) -> Result<Reconciliation> {
        let view = self.store.read()?;
        OverpaymentLedger::reconcile(&*view, client_id)
    }

    /// plan and apply a posting for an attributed payment
    fn post(
        &self,
        tx: &mut dyn LedgerTx,
        events: &mut EventStore,
        ctx: &CallContext,
        payment: &NonPosted,
        actor: Actor,
    ) -> Result<Plan> {
        let client_id = payment
            .client_id
            .ok_or(EngineError::Unattributed { id: payment.id })?;

        ctx.checkpoint("load position", &self.time)?;
        let mut position = ClientPosition::lock(&mut *tx, client_id, LoanTarget::Active)?;
        let plan = plan_posting(&position, payment.amount)?;
        debug!(
            branch = ?plan.branch,
            actions = plan.actions.len(),
            standing = %position.overpayment,
            "planned allocation"
        );

        Applier::new(&mut *tx, &self.time, ctx, &self.config, events, actor)
            .for_payment(payment.id)
            .apply(&plan, Some(&mut position))?;
        Ok(plan)
    }

    fn received(&self, payment: &NonPosted) -> Event {
        Event::PaymentReceived {
            payment_id: payment.id,
            source: payment.source,
            amount: payment.amount,
            client_id: payment.client_id,
            timestamp: self.time.now(),
        }
    }

    /// caller's context narrowed by the configured transaction timeout
    fn bounded(&self, ctx: &CallContext) -> CallContext {
        match self.config.transaction_timeout() {
            Some(timeout) => ctx.clone().with_timeout(&self.time, timeout),
            None => ctx.clone(),
        }
    }

    /// run `work` in one transaction; commit on success, roll back on any error
    fn run<T>(
        &self,
        ctx: &CallContext,
        work: impl FnOnce(&mut dyn LedgerTx, &mut EventStore) -> Result<T>,
    ) -> Result<(T, Vec<Event>)> {
        ctx.checkpoint("begin", &self.time)?;
        let mut tx = self.store.begin()?;
        let mut events = EventStore::new();

        let outcome = work(tx.as_mut(), &mut events).and_then(|value| {
            ctx.checkpoint("commit", &self.time)?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok((value, events.take_events()))
            }
            Err(err) => {
                warn!(error = %err, kind = ?err.kind(), "rolling back");
                match tx.rollback() {
                    Ok(()) => Err(err),
                    Err(rollback) => {
                        error!(error = %err, rollback_error = %rollback, "rollback failed");
                        Err(EngineError::RollbackFailed {
                            source: Box::new(err),
                            rollback: Box::new(rollback),
                        })
                    }
                }
            }
        }
    }
}

/// builder for the router
pub struct PaymentRouterBuilder {
    store: Option<Arc<dyn LedgerStore>>,
    time: Option<SafeTimeProvider>,
    config: EngineConfig,
    span: Option<Span>,
}

impl PaymentRouterBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            time: None,
            config: EngineConfig::default(),
            span: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn time(mut self, time: SafeTimeProvider) -> Self {
        self.time = Some(time);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// parent span for every operation the router runs
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// system time and a `payment_router` span unless set
    pub fn build(self) -> Result<PaymentRouter> {
        let store = self.store.ok_or(EngineError::InvalidConfiguration {
            message: "a ledger store is required".to_string(),
        })?;
        let time = self
            .time
            .unwrap_or_else(|| SafeTimeProvider::new(TimeSource::System));
        let span = self.span.unwrap_or_else(|| info_span!("payment_router"));

        PaymentRouter::new(store, time, self.config, span)
    }
}

impl Default for PaymentRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LoanTerms, MemoryLedger};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn router(ledger: Arc<MemoryLedger>) -> PaymentRouter {
        PaymentRouter::builder()
            .store(ledger)
            .time(SafeTimeProvider::new(TimeSource::Test(
                Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap(),
            )))
            .build()
            .unwrap()
    }

    fn incoming(reference: &str, account: &str, amount: i64) -> IncomingPayment {
        IncomingPayment {
            external_ref: reference.to_string(),
            payer_account: account.to_string(),
            payer_phone: "254799999999".to_string(),
            payer_name: "payer".to_string(),
            amount: Money::from_major(amount),
            paid_at: None,
            origin: TransactionSource::External,
        }
    }

    #[test]
    fn test_builder_requires_store() {
        let err = PaymentRouter::builder().build().err().unwrap();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_receive_allocates_for_known_payer() {
        let ledger = Arc::new(MemoryLedger::new());
        let client = ledger.add_client("Akinyi", "254711222333", &["AK-1"]);
        let (loan, _) = ledger
            .disburse_loan(LoanTerms::new(
                client.id,
                Money::from_major(1000),
                2,
                NaiveDate::from_ymd_opt(2024, 10, 8).unwrap(),
            ))
            .unwrap();
        let router = router(ledger.clone());

        let outcome = router
            .receive(incoming("RCV-1", "AK-1", 500), &CallContext::background())
            .unwrap();

        assert_eq!(outcome.branch, Branch::Allocated);
        assert_eq!(outcome.loan_id, Some(loan.id));
        assert_eq!(outcome.payment.client_id, Some(client.id));
        assert!(matches!(outcome.events[0], Event::PaymentReceived { .. }));
    }

    #[test]
    fn test_unknown_payer_is_recorded_only() {
        let ledger = Arc::new(MemoryLedger::new());
        let router = router(ledger.clone());

        let outcome = router
            .receive(incoming("RCV-2", "NOBODY", 500), &CallContext::background())
            .unwrap();

        assert_eq!(outcome.branch, Branch::Unattributed);
        assert!(outcome.payment.client_id.is_none());
        assert!(outcome.actions.is_empty());
        let view = ledger.read().unwrap();
        assert!(view.allocations(outcome.payment.id).unwrap().is_empty());
    }

    #[test]
    fn test_outcome_serializes() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_client("Omondi", "254711222444", &["OM-1"]);
        let router = router(ledger);

        let outcome = router
            .receive(incoming("RCV-3", "OM-1", 250), &CallContext::background())
            .unwrap();
        let json = outcome.to_json_pretty().unwrap();
        assert!(json.contains("NoActiveLoan"));
        assert!(json.contains("250"));
    }
}
