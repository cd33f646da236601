//! API routes

pub mod billing;
pub mod health;

#[cfg(test)]
mod billing_tests;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // API routes - under /api/v1
    let mut api_routes = Router::new().route("/billing/plans", get(billing::list_plans));

    if state.billing.is_some() {
        // Stripe webhook (public, uses signature verification)
        api_routes = api_routes.route("/billing/webhook", post(billing::webhook));

        // Protected API routes (auth required) - under /api/v1
        let protected_api_routes = Router::new()
            .route("/billing/subscription", get(billing::get_subscription))
            .route("/billing/payments", get(billing::list_payments))
            .route("/billing/payments/export", get(billing::export_payments))
            .route("/billing/checkout", post(billing::create_checkout))
            .route("/billing/portal", post(billing::create_portal))
            .route("/billing/cancel", post(billing::cancel_subscription))
            .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

        api_routes = api_routes.merge(protected_api_routes);
    }

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .with_state(state)
}
