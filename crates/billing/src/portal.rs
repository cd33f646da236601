//! Stripe Billing Portal

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::checkout::redirect_url;
use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::store::BillingStore;

/// Response for creating a portal session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

/// Portal service for Stripe billing portal sessions
pub struct PortalService {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    app_base_url: String,
}

impl PortalService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            store,
            app_base_url: app_base_url.into(),
        }
    }

    /// Create a billing portal session for the user's processor customer.
    ///
    /// When `customer_id` is given it must be the one on file for the user;
    /// otherwise the stored customer is used.
    pub async fn create_portal_session(
        &self,
        user_id: Uuid,
        customer_id: Option<&str>,
        return_url: Option<&str>,
    ) -> BillingResult<PortalResponse> {
        let on_file = self
            .store
            .customer_id_for_user(user_id)
            .await?
            .ok_or(BillingError::NoCustomer)?;

        if let Some(requested) = customer_id {
            if requested != on_file {
                tracing::warn!(
                    user_id = %user_id,
                    customer_id = %requested,
                    "Customer ID ownership verification failed"
                );
                return Err(BillingError::Unauthorized(
                    "Customer ID does not belong to this user".to_string(),
                ));
            }
        }

        let return_url = redirect_url(
            return_url,
            format!("{}/billing", self.app_base_url),
            &self.app_base_url,
        )?;

        let url = self
            .processor
            .create_portal_session(&on_file, &return_url)
            .await?;

        tracing::info!(user_id = %user_id, "Created billing portal session");

        Ok(PortalResponse { url })
    }
}
