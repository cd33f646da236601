// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PrepBuddy Billing Module
//!
//! Keeps subscription and payment state in sync with Stripe.
//!
//! ## Features
//!
//! - **Webhooks**: Verify Stripe deliveries and write subscription/payment rows
//! - **Checkout**: Hosted checkout pages for paid plans
//! - **Portal**: Self-service billing management for existing customers
//! - **Subscriptions**: Current subscription, entitlement, cancellation at period end
//! - **History**: Recent payments and CSV export

pub mod checkout;
pub mod client;
pub mod error;
pub mod history;
pub mod portal;
pub mod processor;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::PaymentHistoryService;

// Portal
pub use portal::{PortalResponse, PortalService};

// Processor
pub use processor::{CheckoutSessionParams, PaymentProcessor, ProcessorSubscription};

// Store
pub use store::{
    BillingStore, EventClaim, MemoryBillingStore, NewPayment, NewSubscription, PgBillingStore,
    SubscriptionChanges, UpdateOutcome, PAYMENT_HISTORY_LIMIT,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{
    signature_header, WebhookEvent, WebhookEventKind, WebhookHandler, WebhookOutcome,
};

use std::sync::Arc;

use prepbuddy_shared::PlanCatalog;
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub history: PaymentHistoryService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let processor = Arc::new(StripeClient::new(config.clone()));
        let store = Arc::new(PgBillingStore::new(pool));
        Self::with_parts(config, store, processor)
    }

    /// Assemble from an explicit store and processor
    pub fn with_parts(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        let catalog = config.catalog();

        Self {
            checkout: CheckoutService::new(
                processor.clone(),
                store.clone(),
                catalog.clone(),
                config.app_base_url.clone(),
            ),
            history: PaymentHistoryService::new(store.clone()),
            portal: PortalService::new(processor.clone(), store.clone(), config.app_base_url),
            subscriptions: SubscriptionService::new(
                processor.clone(),
                store.clone(),
                catalog.clone(),
            ),
            webhooks: WebhookHandler::new(
                processor,
                store.clone(),
                catalog.clone(),
                config.webhook_secret,
            ),
            store,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }
}
