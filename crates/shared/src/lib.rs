//! PrepBuddy Shared Types and Utilities
//!
//! This crate contains the plan catalog, persisted billing record types, and the
//! entitlement rules shared by the API server, the billing crate, and the client.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

#[cfg(feature = "db")]
pub mod db;
pub mod entitlement;
pub mod error;
pub mod plans;
pub mod types;

#[cfg(feature = "db")]
pub use db::*;
pub use entitlement::{Entitlement, EntitlementSource};
pub use error::SharedError;
pub use plans::{
    format_price, BillingPeriod, Plan, PlanCatalog, PriceIds, UsageLimit, UsageLimits,
    FREE_PLAN_ID,
};
pub use types::*;
