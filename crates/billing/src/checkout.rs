//! Stripe Checkout sessions

use std::sync::Arc;

use prepbuddy_shared::PlanCatalog;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{CheckoutSessionParams, PaymentProcessor};
use crate::store::BillingStore;

/// Response for creating a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            store,
            catalog,
            app_base_url: app_base_url.into(),
        }
    }

    /// Create a hosted checkout page for a paid plan.
    ///
    /// The user's existing processor customer is reused when one is on file so
    /// resubscribing does not create a second customer.
    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        price_id: &str,
        success_url: Option<&str>,
        cancel_url: Option<&str>,
    ) -> BillingResult<CheckoutResponse> {
        let plan = self
            .catalog
            .plan_for_price_id(price_id)
            .filter(|plan| !plan.is_free())
            .ok_or_else(|| BillingError::InvalidPrice(price_id.to_string()))?;

        let success_url = redirect_url(
            success_url,
            format!("{}/billing?checkout=success", self.app_base_url),
            &self.app_base_url,
        )?;
        let cancel_url = redirect_url(
            cancel_url,
            format!("{}/billing?checkout=canceled", self.app_base_url),
            &self.app_base_url,
        )?;

        let customer_id = self.store.customer_id_for_user(user_id).await?;

        let url = self
            .processor
            .create_checkout_session(CheckoutSessionParams {
                user_id,
                plan_id: plan.id.clone(),
                price_id: price_id.to_string(),
                customer_id,
                customer_email: email.map(str::to_string),
                success_url,
                cancel_url,
            })
            .await?;

        tracing::info!(user_id = %user_id, plan_id = %plan.id, "Checkout session ready");

        Ok(CheckoutResponse { url })
    }
}

/// Resolve a caller-supplied redirect. It must stay on the app's origin.
pub(crate) fn redirect_url(
    requested: Option<&str>,
    default: String,
    app_base_url: &str,
) -> BillingResult<String> {
    let Some(url) = requested.map(str::trim).filter(|url| !url.is_empty()) else {
        return Ok(default);
    };

    let origin = origin(app_base_url);
    let on_origin = url
        .strip_prefix(origin)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', '#']));

    if on_origin {
        Ok(url.to_string())
    } else {
        Err(BillingError::InvalidInput(format!(
            "Redirect URL must be under {}: {}",
            origin, url
        )))
    }
}

/// `scheme://host[:port]` of an absolute URL
fn origin(url: &str) -> &str {
    let authority = url.find("://").map_or(0, |i| i + 3);
    match url[authority..].find(['/', '?', '#']) {
        Some(end) => &url[..authority + end],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MockPaymentProcessor;
    use crate::store::{MemoryBillingStore, NewSubscription};
    use prepbuddy_shared::SubscriptionStatus;

    fn service(processor: MockPaymentProcessor, store: Arc<MemoryBillingStore>) -> CheckoutService {
        CheckoutService::new(
            Arc::new(processor),
            store,
            PlanCatalog::default(),
            "https://app.prepbuddy.test",
        )
    }

    #[tokio::test]
    async fn test_creates_session_for_paid_price() {
        let user = Uuid::new_v4();
        let mut processor = MockPaymentProcessor::new();
        processor
            .expect_create_checkout_session()
            .times(1)
            .returning(move |params| {
                assert_eq!(params.user_id, user);
                assert_eq!(params.plan_id, "premium");
                assert_eq!(params.customer_id, None);
                assert_eq!(params.customer_email.as_deref(), Some("a@b.test"));
                assert_eq!(params.success_url, "https://app.prepbuddy.test/billing?checkout=success");
                Ok("https://checkout.stripe.test/cs_1".to_string())
            });

        let response = service(processor, Arc::new(MemoryBillingStore::new()))
            .create_checkout_session(
                user,
                Some("a@b.test"),
                "price_prepbuddy_premium_monthly",
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.url, "https://checkout.stripe.test/cs_1");
    }

    #[tokio::test]
    async fn test_reuses_existing_customer() {
        let user = Uuid::new_v4();
        let store = Arc::new(MemoryBillingStore::new());
        store
            .upsert_subscription(NewSubscription {
                user_id: user,
                stripe_customer_id: "cus_existing".to_string(),
                stripe_subscription_id: "sub_old".to_string(),
                plan_id: "pro".to_string(),
                status: SubscriptionStatus::Canceled,
                current_period_start: None,
                current_period_end: None,
                cancel_at_period_end: false,
                trial_end: None,
            })
            .await
            .unwrap();

        let mut processor = MockPaymentProcessor::new();
        processor
            .expect_create_checkout_session()
            .times(1)
            .returning(|params| {
                assert_eq!(params.customer_id.as_deref(), Some("cus_existing"));
                assert_eq!(params.cancel_url, "https://app.prepbuddy.test/plans?from=checkout");
                Ok("https://checkout.stripe.test/cs_2".to_string())
            });

        service(processor, store)
            .create_checkout_session(
                user,
                None,
                "price_prepbuddy_pro_monthly",
                Some("https://app.prepbuddy.test/done"),
                Some("https://app.prepbuddy.test/plans?from=checkout"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_relative_input_without_processor_call() {
        let service = service(MockPaymentProcessor::new(), Arc::new(MemoryBillingStore::new()));
        let user = Uuid::new_v4();

        assert!(matches!(
            service.create_checkout_session(user, None, "price_nope", None, None).await,
            Err(BillingError::InvalidPrice(_))
        ));
        assert!(matches!(
            service
                .create_checkout_session(user, None, "price_prepbuddy_pro_monthly", Some("/billing"), None)
                .await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_redirects_off_the_app_origin() {
        let service = service(MockPaymentProcessor::new(), Arc::new(MemoryBillingStore::new()));
        let user = Uuid::new_v4();

        for url in [
            "https://evil.test/billing",
            "https://app.prepbuddy.test.evil.test/billing",
            "https://app.prepbuddy.test@evil.test/",
            "http://app.prepbuddy.test/billing",
        ] {
            assert!(
                matches!(
                    service
                        .create_checkout_session(user, None, "price_prepbuddy_pro_monthly", Some(url), None)
                        .await,
                    Err(BillingError::InvalidInput(_))
                ),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_origin() {
        assert_eq!(origin("https://app.prepbuddy.test"), "https://app.prepbuddy.test");
        assert_eq!(origin("http://localhost:5173/app"), "http://localhost:5173");
        assert_eq!(origin("https://app.test?x=1"), "https://app.test");
    }
}
