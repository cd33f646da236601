//! Error types for PrepBuddy shared types

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("Unknown subscription status: {0}")]
    UnknownSubscriptionStatus(String),

    #[error("Unknown payment status: {0}")]
    UnknownPaymentStatus(String),

    #[error("Unknown billing period: {0}")]
    UnknownBillingPeriod(String),

    #[error("Invalid usage limit: {0}")]
    InvalidUsageLimit(String),
}
