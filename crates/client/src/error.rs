//! Client error types

use thiserror::Error;

/// Errors surfaced by the subscription store
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("No billing account found. Subscribe to a plan first.")]
    NoCustomer,

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Message suitable for an inline banner
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Http(_) => "Could not reach the billing service. Please try again.".to_string(),
            ClientError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Cache(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Cache(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
