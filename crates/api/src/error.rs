//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prepbuddy_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Billing errors
    #[error("No active subscription")]
    NoActiveSubscription,
    #[error("No billing account on file")]
    NoCustomer,
    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            // Billing
            ApiError::NoActiveSubscription => (StatusCode::NOT_FOUND, "NO_ACTIVE_SUBSCRIPTION", self.to_string()),
            ApiError::NoCustomer => (StatusCode::NOT_FOUND, "NO_CUSTOMER", self.to_string()),
            ApiError::PaymentProvider(_) => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR", "Payment provider request failed".to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NoActiveSubscription => ApiError::NoActiveSubscription,
            BillingError::NoCustomer => ApiError::NoCustomer,
            BillingError::InvalidPrice(price) => {
                ApiError::Validation(format!("Unknown or non-purchasable price: {}", price))
            }
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookPayload(msg) => ApiError::BadRequest(msg),
            BillingError::Unauthorized(msg) => {
                tracing::warn!(reason = %msg, "Billing ownership check failed");
                ApiError::Forbidden
            }
            BillingError::CustomerNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound
            }
            BillingError::StripeApi(msg) => {
                tracing::error!(error = %msg, "Stripe API error");
                ApiError::PaymentProvider(msg)
            }
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Database(msg)
            }
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
