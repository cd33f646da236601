//! Persistence for subscription and payment state
//!
//! The webhook handler is the only writer of subscription and payment rows; the
//! read methods back the API and the client store. [`PgBillingStore`] is the
//! production implementation, [`MemoryBillingStore`] serves tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use prepbuddy_shared::{PaymentRecord, PaymentStatus, SubscriptionRecord, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Subscription row created or refreshed by a completed checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
}

/// Fields overwritten by a subscription lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChanges {
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
}

impl SubscriptionChanges {
    /// Whether applying these changes would leave `record` as it is
    pub fn matches(&self, record: &SubscriptionRecord) -> bool {
        record.plan_id == self.plan_id
            && record.status == self.status
            && record.current_period_start == self.current_period_start
            && record.current_period_end == self.current_period_end
            && record.cancel_at_period_end == self.cancel_at_period_end
            && record.trial_end == self.trial_end
    }
}

/// Payment history entry to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub description: Option<String>,
}

/// Result of an overwrite keyed by processor subscription id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(SubscriptionRecord),
    /// The row already held these values; `updated_at` was left alone
    Unchanged(SubscriptionRecord),
    NotFound,
}

/// Result of claiming a webhook event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    AlreadyProcessed,
    InProgress,
}

/// Minutes after which a delivery stuck in `processing` may be re-claimed
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Maximum rows returned by a payment history read
pub const PAYMENT_HISTORY_LIMIT: i64 = 50;

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Insert or refresh the row keyed by (user, processor subscription id)
    async fn upsert_subscription(&self, subscription: NewSubscription)
        -> BillingResult<SubscriptionRecord>;

    async fn update_subscription(
        &self,
        stripe_subscription_id: &str,
        changes: SubscriptionChanges,
    ) -> BillingResult<UpdateOutcome>;

    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<UpdateOutcome>;

    async fn find_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recently updated row for a processor customer
    async fn find_by_customer_id(&self, customer_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Newest active or trialing row for the user
    async fn active_subscription(&self, user_id: Uuid)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recently updated row for the user, of any status
    async fn latest_subscription(&self, user_id: Uuid)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Processor customer id from the user's most recent row, if any
    async fn customer_id_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>>;

    /// Append a payment; returns false when this invoice outcome was already recorded
    async fn record_payment(&self, payment: NewPayment) -> BillingResult<bool>;

    /// Newest first, at most `limit` rows
    async fn payment_history(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<PaymentRecord>>;

    async fn claim_webhook_event(&self, event_id: &str, event_type: &str)
        -> BillingResult<EventClaim>;

    /// Record the processing result; `error` is `None` on success
    async fn finish_webhook_event(&self, event_id: &str, error: Option<String>)
        -> BillingResult<()>;

    /// Connectivity check for readiness
    async fn ping(&self) -> BillingResult<()>;
}
