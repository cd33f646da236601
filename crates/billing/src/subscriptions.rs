//! Subscription reads and cancellation
//!
//! Reads come from the persisted rows the webhook handler writes. Cancellation
//! only asks the processor to stop renewal; the resulting
//! `customer.subscription.updated` event is what changes the row.

use std::sync::Arc;

use prepbuddy_shared::{Entitlement, PlanCatalog, SubscriptionRecord};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::store::BillingStore;

/// Subscription management service
pub struct SubscriptionService {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            processor,
            store,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The user's active or trialing subscription, else their most recent one
    pub async fn current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        if let Some(active) = self.store.active_subscription(user_id).await? {
            return Ok(Some(active));
        }
        self.store.latest_subscription(user_id).await
    }

    pub async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.active_subscription(user_id).await
    }

    /// Authoritative entitlement from the persisted row
    pub async fn entitlement(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let subscription = self.current_subscription(user_id).await?;
        Ok(Entitlement::derive(&self.catalog, subscription.as_ref()))
    }

    /// Schedule cancellation of the user's active subscription at period end
    pub async fn cancel_subscription(&self, user_id: Uuid) -> BillingResult<()> {
        let subscription_id = self
            .store
            .active_subscription(user_id)
            .await?
            .and_then(|s| s.stripe_subscription_id)
            .ok_or(BillingError::NoActiveSubscription)?;

        let updated = self
            .processor
            .cancel_subscription_at_period_end(&subscription_id)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            cancel_at_period_end = updated.cancel_at_period_end,
            "Requested subscription cancellation"
        );

        Ok(())
    }
}
