//! In-memory billing store for tests and local development

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use prepbuddy_shared::{PaymentRecord, SubscriptionRecord, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, NewPayment, NewSubscription, SubscriptionChanges, UpdateOutcome,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
struct WebhookEventRow {
    result: String,
    error_message: Option<String>,
    received_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: Vec<SubscriptionRecord>,
    payments: Vec<PaymentRecord>,
    webhook_events: HashMap<String, WebhookEventRow>,
}

/// Billing store holding everything in process memory
#[derive(Debug, Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> BillingResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("billing store lock poisoned".to_string()))
    }

    /// Every subscription row, in insertion order
    pub fn subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self.state()?.subscriptions.clone())
    }

    /// Every payment row, in insertion order
    pub fn payments(&self) -> BillingResult<Vec<PaymentRecord>> {
        Ok(self.state()?.payments.clone())
    }

    /// Recorded processing result of a webhook event
    pub fn webhook_event_result(&self, event_id: &str) -> BillingResult<Option<(String, Option<String>)>> {
        Ok(self
            .state()?
            .webhook_events
            .get(event_id)
            .map(|row| (row.result.clone(), row.error_message.clone())))
    }

    /// Seed a subscription row directly
    pub fn insert_subscription(&self, record: SubscriptionRecord) -> BillingResult<()> {
        self.state()?.subscriptions.push(record);
        Ok(())
    }
}

fn latest<'a, I>(rows: I) -> Option<&'a SubscriptionRecord>
where
    I: Iterator<Item = &'a SubscriptionRecord>,
{
    // max_by_key keeps the last of equal keys, so ties go to the newest insert
    rows.max_by_key(|s| (s.updated_at, s.created_at))
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn upsert_subscription(
        &self,
        subscription: NewSubscription,
    ) -> BillingResult<SubscriptionRecord> {
        let mut state = self.state()?;
        let now = OffsetDateTime::now_utc();

        let existing = state.subscriptions.iter_mut().find(|s| {
            s.user_id == subscription.user_id
                && s.stripe_subscription_id.as_deref()
                    == Some(subscription.stripe_subscription_id.as_str())
        });

        if let Some(row) = existing {
            row.stripe_customer_id = Some(subscription.stripe_customer_id);
            row.plan_id = subscription.plan_id;
            row.status = subscription.status;
            row.current_period_start = subscription.current_period_start;
            row.current_period_end = subscription.current_period_end;
            row.cancel_at_period_end = subscription.cancel_at_period_end;
            row.trial_end = subscription.trial_end;
            row.updated_at = now;
            return Ok(row.clone());
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            stripe_customer_id: Some(subscription.stripe_customer_id),
            stripe_subscription_id: Some(subscription.stripe_subscription_id),
            plan_id: subscription.plan_id,
            status: subscription.status,
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            trial_end: subscription.trial_end,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn update_subscription(
        &self,
        stripe_subscription_id: &str,
        changes: SubscriptionChanges,
    ) -> BillingResult<UpdateOutcome> {
        let mut state = self.state()?;
        let Some(row) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
        else {
            return Ok(UpdateOutcome::NotFound);
        };

        if changes.matches(row) {
            return Ok(UpdateOutcome::Unchanged(row.clone()));
        }

        row.plan_id = changes.plan_id;
        row.status = changes.status;
        row.current_period_start = changes.current_period_start;
        row.current_period_end = changes.current_period_end;
        row.cancel_at_period_end = changes.cancel_at_period_end;
        row.trial_end = changes.trial_end;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(UpdateOutcome::Updated(row.clone()))
    }

    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<UpdateOutcome> {
        let mut state = self.state()?;
        let Some(row) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
        else {
            return Ok(UpdateOutcome::NotFound);
        };

        if row.status == SubscriptionStatus::Canceled {
            return Ok(UpdateOutcome::Unchanged(row.clone()));
        }

        row.status = SubscriptionStatus::Canceled;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(UpdateOutcome::Updated(row.clone()))
    }

    async fn find_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state()?
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state()?;
        Ok(latest(
            state
                .subscriptions
                .iter()
                .filter(|s| s.stripe_customer_id.as_deref() == Some(customer_id)),
        )
        .cloned())
    }

    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state()?;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status.grants_access())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn latest_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state()?;
        Ok(latest(state.subscriptions.iter().filter(|s| s.user_id == user_id)).cloned())
    }

    async fn customer_id_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let state = self.state()?;
        Ok(latest(
            state
                .subscriptions
                .iter()
                .filter(|s| s.user_id == user_id && s.stripe_customer_id.is_some()),
        )
        .and_then(|s| s.stripe_customer_id.clone()))
    }

    async fn record_payment(&self, payment: NewPayment) -> BillingResult<bool> {
        let mut state = self.state()?;

        if let Some(invoice_id) = payment.stripe_invoice_id.as_deref() {
            if state
                .payments
                .iter()
                .any(|p| {
                    p.stripe_invoice_id.as_deref() == Some(invoice_id) && p.status == payment.status
                })
            {
                return Ok(false);
            }
        }

        state.payments.push(PaymentRecord {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            subscription_id: payment.subscription_id,
            stripe_payment_intent_id: payment.stripe_payment_intent_id,
            stripe_invoice_id: payment.stripe_invoice_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            description: payment.description,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(true)
    }

    async fn payment_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let state = self.state()?;
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);

        // Reverse first so equal timestamps still list the newest insert first
        let mut rows: Vec<_> = state
            .payments
            .iter()
            .rev()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
    ) -> BillingResult<EventClaim> {
        let mut state = self.state()?;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES);

        if let Some(row) = state.webhook_events.get(event_id) {
            let reclaimable = row.result == "error"
                || (row.result == "processing" && row.received_at < stale_before);
            if !reclaimable {
                return Ok(if row.result == "success" {
                    EventClaim::AlreadyProcessed
                } else {
                    EventClaim::InProgress
                });
            }
        }

        state.webhook_events.insert(
            event_id.to_string(),
            WebhookEventRow {
                result: "processing".to_string(),
                error_message: None,
                received_at: now,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error: Option<String>,
    ) -> BillingResult<()> {
        let mut state = self.state()?;
        if let Some(row) = state.webhook_events.get_mut(event_id) {
            row.result = if error.is_some() { "error" } else { "success" }.to_string();
            row.error_message = error;
        }
        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        self.state().map(|_| ())
    }
}
