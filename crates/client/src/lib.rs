#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PrepBuddy Client
//!
//! Subscription store for PrepBuddy front ends. Talks to the billing API with
//! the caller's bearer token, keeps a persisted cache for fast paint and
//! answers entitlement questions from it.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod sequence;
pub mod store;

pub use api::{BillingApi, SubscriptionResponse};
pub use cache::{BillingCache, CacheStorage, FileStorage, MemoryStorage, BILLING_CACHE_KEY};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use store::{Session, SubscriptionStore, PAYMENT_HISTORY_LIMIT};

use std::sync::Arc;

/// Build a store with file-backed storage when a cache directory is configured
pub fn store_from_config(config: ClientConfig) -> ClientResult<SubscriptionStore> {
    let storage: Arc<dyn CacheStorage> = match &config.cache_dir {
        Some(dir) => Arc::new(FileStorage::new(dir.clone())),
        None => Arc::new(MemoryStorage::new()),
    };
    SubscriptionStore::new(config, storage)
}
