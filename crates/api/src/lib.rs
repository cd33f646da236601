#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PrepBuddy API Library
//!
//! This crate contains the HTTP server for PrepBuddy billing: the Stripe
//! webhook endpoint, checkout and portal session creation, and authenticated
//! subscription and payment history reads.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
