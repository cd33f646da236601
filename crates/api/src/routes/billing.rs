//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use prepbuddy_billing::{CheckoutResponse, PortalResponse, WebhookOutcome};
use prepbuddy_shared::{
    BillingPeriod, Entitlement, PaymentRecord, Plan, SubscriptionRecord, UsageLimits,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

// ============================================================================
// Plans
// ============================================================================

/// Plan as shown on the pricing page
#[derive(Debug, Serialize)]
pub struct PlanView {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub interval: BillingPeriod,
    pub formatted_price: String,
    pub price_id: Option<String>,
    pub features: Vec<String>,
    pub limits: UsageLimits,
}

impl From<&Plan> for PlanView {
    fn from(plan: &Plan) -> Self {
        Self {
            id: plan.id.clone(),
            name: plan.name.clone(),
            price: plan.price,
            currency: plan.currency.clone(),
            interval: plan.interval,
            formatted_price: plan.display_price(),
            price_id: plan.price_id.clone(),
            features: plan.features.clone(),
            limits: plan.limits,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<PlanView>,
}

/// List the plan catalog
pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    Json(PlansResponse {
        plans: state.catalog.plans().iter().map(PlanView::from).collect(),
    })
}

// ============================================================================
// Subscription
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<SubscriptionRecord>,
    pub entitlement: Entitlement,
}

/// Get the caller's subscription and derived entitlement
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let billing = state.billing()?;

    let subscription = billing
        .subscriptions
        .current_subscription(auth_user.user_id)
        .await?;
    let entitlement = Entitlement::derive(billing.catalog(), subscription.as_ref());

    Ok(Json(SubscriptionResponse {
        subscription,
        entitlement,
    }))
}

/// Cancel the caller's subscription at the end of the billing period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<StatusCode, ApiError> {
    let billing = state.billing()?;

    billing
        .subscriptions
        .cancel_subscription(auth_user.user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Payment History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PaymentsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub payments: Vec<PaymentRecord>,
}

/// Recent payments, newest first
pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<PaymentsQuery>,
) -> Result<Json<PaymentsResponse>, ApiError> {
    let billing = state.billing()?;

    let payments = billing
        .history
        .recent_payments(auth_user.user_id, query.limit)
        .await?;

    Ok(Json(PaymentsResponse { payments }))
}

/// Payment history as a CSV download
pub async fn export_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let billing = state.billing()?;

    let csv = billing.history.export_csv(auth_user.user_id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"payment-history.csv\"",
            ),
        ],
        csv,
    ))
}

// ============================================================================
// Checkout & Portal
// ============================================================================

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub price_id: String,
    /// Must match the authenticated caller when present
    pub user_id: Option<Uuid>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// Create a checkout session for a paid plan
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let billing = state.billing()?;

    if req.user_id.is_some_and(|id| id != auth_user.user_id) {
        tracing::warn!(
            user_id = %auth_user.user_id,
            "Checkout requested on behalf of another user"
        );
        return Err(ApiError::Forbidden);
    }

    let response = billing
        .checkout
        .create_checkout_session(
            auth_user.user_id,
            auth_user.email.as_deref(),
            &req.price_id,
            req.success_url.as_deref(),
            req.cancel_url.as_deref(),
        )
        .await?;

    Ok(Json(response))
}

/// Request to create a billing portal session
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePortalRequest {
    pub customer_id: Option<String>,
    pub return_url: Option<String>,
}

/// Create a billing portal session
pub async fn create_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreatePortalRequest>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing()?;

    let response = billing
        .portal
        .create_portal_session(
            auth_user.user_id,
            req.customer_id.as_deref(),
            req.return_url.as_deref(),
        )
        .await?;

    Ok(Json(response))
}

// ============================================================================
// Webhook
// ============================================================================

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing()?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Nothing is read or written before this passes
    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook verification failed");
            ApiError::from(e)
        })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Any failure past verification is a 500 so Stripe retries
    let outcome = billing.webhooks.handle_event(&event).await.map_err(|e| {
        tracing::error!(event_id = %event.id, error = %e, "Webhook handling error");
        ApiError::Internal
    })?;

    match outcome {
        WebhookOutcome::Processed => tracing::info!(event_id = %event.id, "Stripe webhook processed"),
        WebhookOutcome::Ignored => tracing::info!(event_id = %event.id, "Stripe webhook acknowledged"),
        WebhookOutcome::Duplicate => tracing::info!(event_id = %event.id, "Stripe webhook duplicate"),
    }

    Ok(StatusCode::OK)
}
