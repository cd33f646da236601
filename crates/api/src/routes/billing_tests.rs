//! Route tests for the billing API

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use prepbuddy_billing::{
    signature_header, BillingResult, BillingService, CheckoutSessionParams, MemoryBillingStore,
    PaymentProcessor, ProcessorSubscription, StripeConfig,
};
use prepbuddy_shared::{PriceIds, SubscriptionStatus};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::auth::jwt::tests::{token_for, TEST_SECRET};
use crate::config::Config;
use crate::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_routes";

/// Processor double recording every call by name
#[derive(Default)]
struct RecordingProcessor {
    calls: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn subscription(status: &str) -> ProcessorSubscription {
    serde_json::from_value(json!({
        "id": "sub_route",
        "customer": "cus_route",
        "status": status,
        "current_period_start": 1767225600,
        "current_period_end": 1769904000,
        "items": { "data": [ { "price": { "id": "price_prepbuddy_pro_monthly" } } ] }
    }))
    .unwrap()
}

#[async_trait]
impl PaymentProcessor for RecordingProcessor {
    async fn retrieve_subscription(&self, id: &str) -> BillingResult<ProcessorSubscription> {
        self.record(format!("retrieve:{}", id));
        Ok(subscription("active"))
    }

    async fn create_checkout_session(&self, params: CheckoutSessionParams) -> BillingResult<String> {
        self.record(format!("checkout:{}", params.plan_id));
        Ok("https://checkout.stripe.test/cs_route".to_string())
    }

    async fn create_portal_session(&self, customer: &str, _return_url: &str) -> BillingResult<String> {
        self.record(format!("portal:{}", customer));
        Ok("https://billing.stripe.test/p_route".to_string())
    }

    async fn cancel_subscription_at_period_end(&self, id: &str) -> BillingResult<ProcessorSubscription> {
        self.record(format!("cancel:{}", id));
        Ok(subscription("active"))
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryBillingStore>,
    processor: Arc<RecordingProcessor>,
}

fn test_config(enable_billing: bool) -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "https://app.prepbuddy.test".to_string(),
        cors_allowed_origins: vec!["https://app.prepbuddy.test".to_string()],
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        supabase_jwt_secret: TEST_SECRET.to_string(),
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
        stripe_price_ids: PriceIds::default(),
        enable_billing,
    }
}

fn test_app() -> TestApp {
    let config = test_config(true);
    let store = Arc::new(MemoryBillingStore::new());
    let processor = Arc::new(RecordingProcessor::default());

    let stripe_config = config.stripe_config().unwrap();
    let billing = BillingService::with_parts(stripe_config, store.clone(), processor.clone());
    let state = AppState::new(config, store.clone(), Some(billing));

    TestApp {
        router: create_router(state),
        store,
        processor,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn authed(method: &str, uri: &str, user: Uuid, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", token_for(user, TEST_SECRET, 3600, "authenticated")),
        );
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/billing/webhook")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

fn signed(payload: &str) -> Option<String> {
    Some(signature_header(WEBHOOK_SECRET, OffsetDateTime::now_utc().unix_timestamp(), payload).unwrap())
}

fn event_payload(id: &str, event_type: &str, object: Value) -> String {
    json!({ "id": id, "type": event_type, "created": 1767225600, "data": { "object": object } })
        .to_string()
}

fn checkout_payload(user: Uuid) -> String {
    event_payload(
        "evt_checkout",
        "checkout.session.completed",
        json!({
            "id": "cs_route",
            "customer": "cus_route",
            "subscription": "sub_route",
            "metadata": { "user_id": user.to_string() }
        }),
    )
}

#[tokio::test]
async fn test_plans_are_public() {
    let app = test_app();
    let request = Request::builder()
        .uri("/api/v1/billing/plans")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let body = json_body(&body);
    let plans = body["plans"].as_array().unwrap();
    assert_eq!(plans.len(), 4);
    assert_eq!(plans[0]["id"], "free");
    assert_eq!(plans[0]["formatted_price"], "$0.00");
    assert_eq!(plans[1]["formatted_price"], "$9.99");
}

#[tokio::test]
async fn test_subscription_requires_auth() {
    let app = test_app();

    let request = Request::builder()
        .uri("/api/v1/billing/subscription")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["error"]["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/api/v1/billing/subscription")
        .header(header::AUTHORIZATION, "Bearer garbage")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_no_subscription_means_free_plan() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/v1/billing/subscription", Uuid::new_v4(), None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert!(body["subscription"].is_null());
    assert_eq!(body["entitlement"]["plan_id"], "free");
    assert_eq!(body["entitlement"]["is_subscribed"], false);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signatures_without_writing() {
    let app = test_app();
    let payload = checkout_payload(Uuid::new_v4());

    let (status, _) = send(&app.router, webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = signature_header("whsec_wrong", OffsetDateTime::now_utc().unix_timestamp(), &payload)
        .unwrap();
    let (status, body) = send(&app.router, webhook_request(&payload, Some(forged))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["code"], "BAD_REQUEST");

    assert!(app.store.subscriptions().unwrap().is_empty());
    assert!(app.processor.calls().is_empty());
}

#[tokio::test]
async fn test_webhook_lifecycle_end_to_end() {
    let app = test_app();
    let user = Uuid::new_v4();

    let payload = checkout_payload(user);
    let (status, _) = send(&app.router, webhook_request(&payload, signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app.router, authed("GET", "/api/v1/billing/subscription", user, None)).await;
    let body = json_body(&body);
    assert_eq!(body["subscription"]["plan_id"], "pro");
    assert_eq!(body["entitlement"]["is_subscribed"], true);

    let deleted = event_payload(
        "evt_deleted",
        "customer.subscription.deleted",
        json!({ "id": "sub_route", "customer": "cus_route", "status": "canceled" }),
    );
    let (status, _) = send(&app.router, webhook_request(&deleted, signed(&deleted))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app.router, authed("GET", "/api/v1/billing/subscription", user, None)).await;
    let body = json_body(&body);
    assert_eq!(body["subscription"]["status"], "canceled");
    assert_eq!(body["entitlement"]["plan_id"], "free");

    let rows = app.store.subscriptions().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_webhook_unknown_type_is_acknowledged() {
    let app = test_app();
    let payload = event_payload("evt_other", "customer.created", json!({ "id": "cus_1" }));

    let (status, _) = send(&app.router, webhook_request(&payload, signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_webhook_processing_failure_is_500() {
    let app = test_app();
    let payload = event_payload(
        "evt_early_invoice",
        "invoice.payment_succeeded",
        json!({ "id": "in_1", "customer": "cus_unknown", "subscription": "sub_unknown", "amount_paid": 999 }),
    );

    let (status, _) = send(&app.router, webhook_request(&payload, signed(&payload))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(app.store.payments().unwrap().is_empty());
}

#[tokio::test]
async fn test_checkout_is_scoped_to_the_caller() {
    let app = test_app();
    let user = Uuid::new_v4();

    let (status, _) = send(
        &app.router,
        authed(
            "POST",
            "/api/v1/billing/checkout",
            user,
            Some(json!({ "priceId": "price_prepbuddy_pro_monthly", "userId": Uuid::new_v4() })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app.router,
        authed(
            "POST",
            "/api/v1/billing/checkout",
            user,
            Some(json!({
                "priceId": "price_prepbuddy_pro_monthly",
                "userId": user,
                "successUrl": "https://app.prepbuddy.test/done",
                "cancelUrl": "https://app.prepbuddy.test/billing"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["url"], "https://checkout.stripe.test/cs_route");
    assert_eq!(app.processor.calls(), vec!["checkout:pro".to_string()]);
}

#[tokio::test]
async fn test_checkout_rejects_unknown_price() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        authed(
            "POST",
            "/api/v1/billing/checkout",
            Uuid::new_v4(),
            Some(json!({ "priceId": "price_made_up" })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["code"], "VALIDATION_ERROR");
    assert!(app.processor.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_and_portal_without_subscription() {
    let app = test_app();
    let user = Uuid::new_v4();

    let (status, body) = send(&app.router, authed("POST", "/api/v1/billing/cancel", user, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["code"], "NO_ACTIVE_SUBSCRIPTION");

    let (status, body) = send(
        &app.router,
        authed("POST", "/api/v1/billing/portal", user, Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["code"], "NO_CUSTOMER");

    assert!(app.processor.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_and_portal_for_subscriber() {
    let app = test_app();
    let user = Uuid::new_v4();
    let payload = checkout_payload(user);
    send(&app.router, webhook_request(&payload, signed(&payload))).await;

    let (status, _) = send(&app.router, authed("POST", "/api/v1/billing/cancel", user, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app.router,
        authed(
            "POST",
            "/api/v1/billing/portal",
            user,
            Some(json!({ "customerId": "cus_route", "returnUrl": "https://app.prepbuddy.test/billing" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["url"], "https://billing.stripe.test/p_route");

    assert_eq!(
        app.processor.calls(),
        vec![
            "retrieve:sub_route".to_string(),
            "cancel:sub_route".to_string(),
            "portal:cus_route".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_payment_history_and_export() {
    let app = test_app();
    let user = Uuid::new_v4();
    let payload = checkout_payload(user);
    send(&app.router, webhook_request(&payload, signed(&payload))).await;

    let invoice = event_payload(
        "evt_invoice",
        "invoice.payment_succeeded",
        json!({
            "id": "in_route",
            "customer": "cus_route",
            "subscription": "sub_route",
            "amount_paid": 999,
            "currency": "usd",
            "description": "PrepBuddy Pro"
        }),
    );
    send(&app.router, webhook_request(&invoice, signed(&invoice))).await;

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/v1/billing/payments?limit=10", user, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["payments"].as_array().unwrap().len(), 1);
    assert_eq!(body["payments"][0]["status"], "succeeded");

    let response = app
        .router
        .clone()
        .oneshot(authed("GET", "/api/v1/billing/payments/export", user, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/csv; charset=utf-8"
    );
    let csv = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let csv = String::from_utf8(csv.to_vec()).unwrap();
    assert!(csv.contains("PrepBuddy Pro,9.99,USD,succeeded,in_route"));
}

#[tokio::test]
async fn test_health_and_disabled_billing() {
    let app = test_app();
    let request = Request::builder()
        .uri("/health/ready")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let state = AppState::new(test_config(false), Arc::new(MemoryBillingStore::new()), None);
    let router = create_router(state);

    let (status, _) = send(
        &router,
        authed("GET", "/api/v1/billing/subscription", Uuid::new_v4(), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/api/v1/billing/plans")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
}
