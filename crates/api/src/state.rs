//! Shared application state

use std::sync::Arc;

use prepbuddy_billing::{BillingService, BillingStore};
use prepbuddy_shared::PlanCatalog;

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub catalog: Arc<PlanCatalog>,
    /// Readiness check target
    pub store: Arc<dyn BillingStore>,
    /// `None` when billing is switched off
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn BillingStore>,
        billing: Option<BillingService>,
    ) -> Self {
        let catalog = PlanCatalog::new(config.stripe_price_ids.clone());
        Self {
            jwt_manager: JwtManager::new(&config.supabase_jwt_secret),
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            store,
            billing: billing.map(Arc::new),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing.as_deref().ok_or(ApiError::ServiceUnavailable)
    }
}
