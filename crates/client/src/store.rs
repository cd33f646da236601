//! Subscription store
//!
//! Client-side state container over the billing API. Holds a possibly stale
//! copy of the caller's subscription and payment history, persists it for fast
//! paint, and derives entitlement facts from it. The server re-checks every
//! privileged action, so nothing derived here is authoritative.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use prepbuddy_shared::entitlement::{current_plan, is_subscribed};
use prepbuddy_shared::{
    Entitlement, PaymentRecord, Plan, PlanCatalog, SubscriptionRecord, UsageLimits,
};
use uuid::Uuid;

use crate::api::{BillingApi, CheckoutRequest, PortalRequest};
use crate::cache::{BillingCache, CacheStorage, BILLING_CACHE_KEY};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::sequence::RequestSequence;

/// Payment history rows fetched per refresh
pub const PAYMENT_HISTORY_LIMIT: i64 = 50;

/// Authenticated session issued by the hosted auth provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    session: Option<Session>,
    cache: BillingCache,
    error: Option<String>,
}

/// Decrements the in-flight counter when the request finishes
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SubscriptionStore {
    api: BillingApi,
    catalog: PlanCatalog,
    storage: Arc<dyn CacheStorage>,
    state: RwLock<StoreState>,
    subscription_seq: RequestSequence,
    history_seq: RequestSequence,
    in_flight: AtomicUsize,
}

impl SubscriptionStore {
    /// Create a store, hydrating from the persisted cache
    pub fn new(config: ClientConfig, storage: Arc<dyn CacheStorage>) -> ClientResult<Self> {
        let catalog = PlanCatalog::new(config.price_ids.clone());
        let api = BillingApi::new(config)?;
        let cache = BillingCache::read(storage.as_ref());

        tracing::debug!(
            cached_subscription = cache.subscription.is_some(),
            cached_payments = cache.payment_history.len(),
            "Hydrated billing cache"
        );

        Ok(Self {
            api,
            catalog,
            storage,
            state: RwLock::new(StoreState {
                cache,
                ..Default::default()
            }),
            subscription_seq: RequestSequence::new(),
            history_seq: RequestSequence::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Start an authenticated session and refresh billing state from the server
    pub async fn sign_in(&self, session: Session) -> ClientResult<()> {
        tracing::info!(user_id = %session.user_id, "Billing session started");

        {
            let mut state = self.write();
            if state.session.as_ref().is_some_and(|s| s.user_id != session.user_id) {
                self.subscription_seq.reset();
                self.history_seq.reset();
            }
            // The hydrated cache may belong to whoever used this device before
            if state.cache.retain_user(session.user_id) {
                tracing::info!(user_id = %session.user_id, "Dropped cached billing data of another user");
                self.persist(&state.cache);
            }
            state.session = Some(session);
        }

        self.refresh().await
    }

    /// Forget the session and the persisted cache
    pub fn sign_out(&self) {
        // Responses still in flight belong to the old session
        self.subscription_seq.reset();
        self.history_seq.reset();

        {
            let mut state = self.write();
            *state = StoreState::default();
        }

        if let Err(e) = self.storage.remove(BILLING_CACHE_KEY) {
            tracing::warn!(error = %e, "Failed to clear billing cache");
        }

        tracing::info!("Billing session ended");
    }

    pub fn is_signed_in(&self) -> bool {
        self.read().session.is_some()
    }

    /// Refetch subscription and payment history
    pub async fn refresh(&self) -> ClientResult<()> {
        let (subscription, history) =
            tokio::join!(self.fetch_subscription(), self.fetch_payment_history());
        subscription?;
        history?;
        Ok(())
    }

    fn token(&self) -> ClientResult<String> {
        self.read()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(ClientError::NotAuthenticated)
    }

    fn session(&self) -> ClientResult<Session> {
        self.read().session.clone().ok_or(ClientError::NotAuthenticated)
    }

    // =========================================================================
    // Fetches
    // =========================================================================

    /// Load the caller's subscription. `None` means the free plan.
    pub async fn fetch_subscription(&self) -> ClientResult<Option<SubscriptionRecord>> {
        let token = self.token()?;
        let ticket = self.subscription_seq.begin();
        let _loading = LoadingGuard::start(&self.in_flight);

        let response = self
            .api
            .get_subscription(&token)
            .await
            .map_err(|e| self.fail(e))?;

        if self.subscription_seq.try_apply(ticket) {
            let mut state = self.write();
            state.cache.subscription = response.subscription;
            self.persist(&state.cache);
        } else {
            tracing::debug!(?ticket, "Discarding stale subscription response");
        }

        Ok(self.subscription())
    }

    /// Load up to 50 most recent payments, newest first
    pub async fn fetch_payment_history(&self) -> ClientResult<Vec<PaymentRecord>> {
        let token = self.token()?;
        let ticket = self.history_seq.begin();
        let _loading = LoadingGuard::start(&self.in_flight);

        let payments = self
            .api
            .list_payments(&token, PAYMENT_HISTORY_LIMIT)
            .await
            .map_err(|e| self.fail(e))?;

        if self.history_seq.try_apply(ticket) {
            let mut state = self.write();
            state.cache.payment_history = payments;
            self.persist(&state.cache);
        } else {
            tracing::debug!(?ticket, "Discarding stale payment history response");
        }

        Ok(self.payment_history())
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Get a hosted checkout URL for a paid plan's price
    pub async fn create_checkout_session(&self, price_id: &str) -> ClientResult<String> {
        let session = self.session().map_err(|e| self.fail(e))?;
        let _loading = LoadingGuard::start(&self.in_flight);

        let app_url = &self.api.config().app_url;
        let request = CheckoutRequest {
            price_id,
            user_id: session.user_id,
            success_url: format!("{}/billing?checkout=success", app_url),
            cancel_url: format!("{}/billing?checkout=canceled", app_url),
        };

        let url = self
            .api
            .create_checkout(&session.access_token, &request)
            .await
            .map_err(|e| self.fail(e))?;

        tracing::info!(user_id = %session.user_id, price_id, "Checkout session created");
        Ok(url)
    }

    /// Get a hosted billing management URL. Fails without a network call when
    /// no processor customer is on file.
    pub async fn create_portal_session(&self) -> ClientResult<String> {
        let token = self.token().map_err(|e| self.fail(e))?;
        let customer_id = self
            .subscription()
            .and_then(|s| s.stripe_customer_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| self.fail(ClientError::NoCustomer))?;
        let _loading = LoadingGuard::start(&self.in_flight);

        let request = PortalRequest {
            customer_id: &customer_id,
            return_url: format!("{}/billing", self.api.config().app_url),
        };

        self.api
            .create_portal(&token, &request)
            .await
            .map_err(|e| self.fail(e))
    }

    /// Request cancellation at period end, then refetch. Local status is never
    /// edited; the webhook-updated row is the source of truth.
    pub async fn cancel_subscription(&self) -> ClientResult<()> {
        let token = self.token().map_err(|e| self.fail(e))?;
        let has_subscription_id = self
            .subscription()
            .and_then(|s| s.stripe_subscription_id)
            .is_some_and(|id| !id.is_empty());
        if !has_subscription_id {
            return Err(self.fail(ClientError::NoActiveSubscription));
        }

        {
            let _loading = LoadingGuard::start(&self.in_flight);
            self.api
                .cancel_subscription(&token)
                .await
                .map_err(|e| self.fail(e))?;
        }

        tracing::info!("Subscription cancellation requested");
        self.fetch_subscription().await?;
        Ok(())
    }

    // =========================================================================
    // Derivations
    // =========================================================================

    pub fn subscription(&self) -> Option<SubscriptionRecord> {
        self.read().cache.subscription.clone()
    }

    pub fn payment_history(&self) -> Vec<PaymentRecord> {
        self.read().cache.payment_history.clone()
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Plan for the cached subscription, or the free plan
    pub fn current_plan(&self) -> Plan {
        let state = self.read();
        current_plan(&self.catalog, state.cache.subscription.as_ref()).clone()
    }

    /// True iff the cached subscription is active or trialing
    pub fn is_subscribed(&self) -> bool {
        is_subscribed(self.read().cache.subscription.as_ref())
    }

    /// Static limits of the current plan; no consumption is tracked
    pub fn remaining_usage(&self) -> UsageLimits {
        self.current_plan().limits
    }

    pub fn entitlement(&self) -> Entitlement {
        Entitlement::derive(&self.catalog, self.read().cache.subscription.as_ref())
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.entitlement().has_feature(feature)
    }

    // =========================================================================
    // UI state
    // =========================================================================

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.write().error = None;
    }

    /// Record a user-visible failure and hand the error back
    fn fail(&self, err: ClientError) -> ClientError {
        tracing::warn!(error = %err, "Billing request failed");
        self.write().error = Some(err.user_message());
        err
    }

    fn persist(&self, cache: &BillingCache) {
        if let Err(e) = cache.write(self.storage.as_ref()) {
            tracing::warn!(error = %e, "Failed to persist billing cache");
        }
    }
}
