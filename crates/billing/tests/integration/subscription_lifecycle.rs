//! Integration tests for the subscription lifecycle
//!
//! Drives signed webhook deliveries through `BillingService` backed by the
//! in-memory store and a scripted processor, then reads state back the way the
//! API does.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prepbuddy_billing::{
    signature_header, BillingError, BillingResult, BillingService, CheckoutSessionParams,
    MemoryBillingStore, PaymentProcessor, ProcessorSubscription, StripeConfig, WebhookOutcome,
};
use prepbuddy_shared::{PriceIds, SubscriptionStatus};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

const SECRET: &str = "whsec_integration";

// ============================================================================
// Test Utilities
// ============================================================================

/// Processor returning a fixed subscription and counting cancellations
#[derive(Default)]
struct ScriptedProcessor {
    cancellations: Mutex<Vec<String>>,
}

fn subscription_json(status: &str, price: &str, cancel_at_period_end: bool) -> serde_json::Value {
    json!({
        "id": "sub_live",
        "object": "subscription",
        "customer": "cus_live",
        "status": status,
        "cancel_at_period_end": cancel_at_period_end,
        "items": { "data": [ {
            "price": { "id": price },
            "current_period_start": 1767225600,
            "current_period_end": 1769904000
        } ] }
    })
}

#[async_trait]
impl PaymentProcessor for ScriptedProcessor {
    async fn retrieve_subscription(&self, _id: &str) -> BillingResult<ProcessorSubscription> {
        Ok(serde_json::from_value(subscription_json("trialing", "price_pro", false)).unwrap())
    }

    async fn create_checkout_session(&self, _params: CheckoutSessionParams) -> BillingResult<String> {
        Ok("https://checkout.stripe.test/session".to_string())
    }

    async fn create_portal_session(&self, _customer: &str, _return_url: &str) -> BillingResult<String> {
        Ok("https://billing.stripe.test/session".to_string())
    }

    async fn cancel_subscription_at_period_end(&self, id: &str) -> BillingResult<ProcessorSubscription> {
        self.cancellations.lock().unwrap().push(id.to_string());
        Ok(serde_json::from_value(subscription_json("active", "price_pro", true)).unwrap())
    }
}

fn setup() -> (BillingService, Arc<MemoryBillingStore>, Arc<ScriptedProcessor>) {
    let config = StripeConfig {
        secret_key: "sk_test_unused".to_string(),
        webhook_secret: SECRET.to_string(),
        price_ids: PriceIds {
            pro: "price_pro".to_string(),
            pro_annual: "price_pro_annual".to_string(),
            premium: "price_premium".to_string(),
        },
        app_base_url: "https://app.prepbuddy.test".to_string(),
    };
    let store = Arc::new(MemoryBillingStore::new());
    let processor = Arc::new(ScriptedProcessor::default());
    let service = BillingService::with_parts(config, store.clone(), processor.clone());
    (service, store, processor)
}

async fn deliver(
    service: &BillingService,
    id: &str,
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<WebhookOutcome> {
    let payload = json!({
        "id": id,
        "type": event_type,
        "created": 1767225600,
        "data": { "object": object }
    })
    .to_string();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let header = signature_header(SECRET, now, &payload)?;

    let event = service.webhooks.verify_event(&payload, &header)?;
    service.webhooks.handle_event(&event).await
}

async fn complete_checkout(service: &BillingService, user: Uuid) {
    let outcome = deliver(
        service,
        "evt_checkout",
        "checkout.session.completed",
        json!({
            "id": "cs_live",
            "customer": "cus_live",
            "subscription": "sub_live",
            "metadata": { "user_id": user.to_string() }
        }),
    )
    .await
    .unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_checkout_then_deletion_shows_canceled_subscription() {
    let (service, _store, _processor) = setup();
    let user = Uuid::new_v4();

    complete_checkout(&service, user).await;
    let entitlement = service.subscriptions.entitlement(user).await.unwrap();
    assert_eq!(entitlement.plan_id, "pro");
    assert!(entitlement.is_subscribed);

    deliver(
        &service,
        "evt_deleted",
        "customer.subscription.deleted",
        subscription_json("canceled", "price_pro", false),
    )
    .await
    .unwrap();

    let current = service.subscriptions.current_subscription(user).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Canceled);
    assert_eq!(service.subscriptions.entitlement(user).await.unwrap().plan_id, "free");
}

#[tokio::test]
async fn test_cancel_is_reflected_only_after_the_webhook() {
    let (service, _store, processor) = setup();
    let user = Uuid::new_v4();
    complete_checkout(&service, user).await;

    service.subscriptions.cancel_subscription(user).await.unwrap();
    assert_eq!(*processor.cancellations.lock().unwrap(), vec!["sub_live".to_string()]);

    let before = service.subscriptions.current_subscription(user).await.unwrap().unwrap();
    assert!(!before.cancel_at_period_end);

    deliver(
        &service,
        "evt_updated",
        "customer.subscription.updated",
        subscription_json("active", "price_pro", true),
    )
    .await
    .unwrap();

    let after = service.subscriptions.current_subscription(user).await.unwrap().unwrap();
    assert!(after.cancel_at_period_end);
    assert_eq!(after.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_tampered_delivery_changes_nothing() {
    let (service, store, _processor) = setup();
    let payload = json!({
        "id": "evt_forged",
        "type": "checkout.session.completed",
        "data": { "object": { "id": "cs_x", "subscription": "sub_live",
                              "metadata": { "user_id": Uuid::new_v4().to_string() } } }
    })
    .to_string();
    let header = signature_header("whsec_attacker", OffsetDateTime::now_utc().unix_timestamp(), &payload)
        .unwrap();

    let result = service.webhooks.verify_event(&payload, &header);

    assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    assert!(store.subscriptions().unwrap().is_empty());
    assert_eq!(store.webhook_event_result("evt_forged").unwrap(), None);
}

#[tokio::test]
async fn test_invoice_history_is_newest_first() {
    let (service, _store, _processor) = setup();
    let user = Uuid::new_v4();
    complete_checkout(&service, user).await;

    for (i, event_type) in ["invoice.payment_succeeded", "invoice.payment_failed"].iter().enumerate() {
        deliver(
            &service,
            &format!("evt_inv_{}", i),
            event_type,
            json!({
                "id": format!("in_{}", i),
                "customer": "cus_live",
                "subscription": "sub_live",
                "amount_paid": 999,
                "amount_due": 999,
                "currency": "usd"
            }),
        )
        .await
        .unwrap();
    }

    let payments = service.history.recent_payments(user, None).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0].stripe_invoice_id.as_deref(), Some("in_1"));
    assert_eq!(payments[0].user_id, user);
}
