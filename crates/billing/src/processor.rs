//! Payment processor gateway
//!
//! The billing services talk to Stripe only through [`PaymentProcessor`], which
//! keeps the webhook and subscription logic testable without network access.
//! [`StripeClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use prepbuddy_shared::SubscriptionStatus;
use serde::{Deserialize, Deserializer};
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CustomerId, Expandable, Subscription, SubscriptionId, UpdateSubscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

// =============================================================================
// Processor Types
// =============================================================================

/// Subscription as reported by the processor.
///
/// Deserializes straight from the `data.object` of subscription webhook events
/// and is built from `stripe::Subscription` for API responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessorSubscription {
    pub id: String,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub items: ProcessorSubscriptionItems,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProcessorSubscriptionItems {
    #[serde(default)]
    pub data: Vec<ProcessorSubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessorSubscriptionItem {
    #[serde(default)]
    pub price: Option<ProcessorPrice>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessorPrice {
    pub id: String,
}

impl ProcessorSubscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_processor(&self.status)
    }

    /// Price of the first subscription item
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Period start, falling back to the first item for newer API versions
    /// that moved billing periods onto subscription items.
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_start))
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_end))
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

impl From<&Subscription> for ProcessorSubscription {
    fn from(subscription: &Subscription) -> Self {
        let customer = match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        };

        Self {
            id: subscription.id.to_string(),
            customer,
            status: subscription.status.as_str().to_string(),
            items: ProcessorSubscriptionItems {
                data: subscription
                    .items
                    .data
                    .iter()
                    .map(|item| ProcessorSubscriptionItem {
                        price: item.price.as_ref().map(|p| ProcessorPrice {
                            id: p.id.to_string(),
                        }),
                        current_period_start: None,
                        current_period_end: None,
                    })
                    .collect(),
            },
            current_period_start: Some(subscription.current_period_start),
            current_period_end: Some(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            trial_end: subscription.trial_end,
            metadata: Some(subscription.metadata.clone()),
        }
    }
}

/// Accepts either a bare object id or an expanded object carrying an `id`
pub(crate) fn expandable_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Id(String),
        Object { id: String },
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Id(id) => id,
        Raw::Object { id } => id,
    })
}

/// Like [`expandable_id`] for fields the processor may leave null
pub(crate) fn optional_expandable_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Id(String),
        Object { id: String },
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Id(id) => id,
        Raw::Object { id } => id,
    }))
}

/// Convert a processor unix timestamp
pub(crate) fn timestamp(value: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    value
        .map(|t| {
            OffsetDateTime::from_unix_timestamp(t)
                .map_err(|e| BillingError::WebhookPayload(format!("Invalid timestamp {}: {}", t, e)))
        })
        .transpose()
}

/// Parameters for a hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionParams {
    pub user_id: Uuid,
    pub plan_id: String,
    pub price_id: String,
    /// Existing processor customer to attach the subscription to
    pub customer_id: Option<String>,
    /// Prefills checkout when no customer exists yet
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

// =============================================================================
// Gateway
// =============================================================================

/// Calls the billing services make to the payment processor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Fetch the current state of a subscription
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription>;

    /// Create a hosted checkout page and return its URL
    async fn create_checkout_session(&self, params: CheckoutSessionParams)
        -> BillingResult<String>;

    /// Create a hosted self-service billing page and return its URL
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;

    /// Schedule cancellation at the end of the current billing period
    async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription>;
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.inner(), &sub_id, &[]).await?;
        Ok(ProcessorSubscription::from(&subscription))
    }

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<String> {
        let customer = params
            .customer_id
            .as_deref()
            .map(parse_customer_id)
            .transpose()?;
        let customer_email = match customer {
            Some(_) => None,
            None => params.customer_email.as_deref(),
        };

        let user_id = params.user_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.clone());
        metadata.insert("plan_id".to_string(), params.plan_id.clone());

        let checkout = CreateCheckoutSession {
            customer,
            customer_email,
            client_reference_id: Some(&user_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(params.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&params.success_url),
            cancel_url: Some(&params.cancel_url),
            metadata: Some(metadata.clone()),
            // Copied onto the subscription so lifecycle events can be attributed
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.inner(), checkout).await?;

        tracing::info!(
            user_id = %params.user_id,
            session_id = %session.id,
            plan_id = %params.plan_id,
            "Created checkout session"
        );

        session
            .url
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(self.inner(), params).await?;

        tracing::info!(customer_id = %session.customer, "Created billing portal session");

        Ok(session.url)
    }

    async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = Subscription::update(self.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            "Scheduled subscription cancellation at period end"
        );

        Ok(ProcessorSubscription::from(&subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_subscription_object() {
        let json = serde_json::json!({
            "id": "sub_123",
            "object": "subscription",
            "customer": "cus_123",
            "status": "trialing",
            "current_period_start": 1767225600,
            "current_period_end": 1769904000,
            "cancel_at_period_end": false,
            "trial_end": 1768435200,
            "items": { "object": "list", "data": [ { "id": "si_1", "price": { "id": "price_pro" } } ] },
            "metadata": { "user_id": "00000000-0000-0000-0000-000000000001" }
        });

        let sub: ProcessorSubscription = serde_json::from_value(json).unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Trialing);
        assert_eq!(sub.price_id(), Some("price_pro"));
        assert_eq!(sub.period_start(), Some(1767225600));
        assert_eq!(
            sub.metadata_value("user_id"),
            Some("00000000-0000-0000-0000-000000000001")
        );
    }

    #[test]
    fn test_period_falls_back_to_first_item() {
        let json = serde_json::json!({
            "id": "sub_123",
            "customer": { "id": "cus_expanded", "object": "customer" },
            "status": "active",
            "items": { "data": [ {
                "price": { "id": "price_pro" },
                "current_period_start": 100,
                "current_period_end": 200
            } ] },
            "metadata": null
        });

        let sub: ProcessorSubscription = serde_json::from_value(json).unwrap();
        assert_eq!(sub.customer, "cus_expanded");
        assert_eq!(sub.period_start(), Some(100));
        assert_eq!(sub.period_end(), Some(200));
        assert_eq!(sub.metadata_value("user_id"), None);
    }

    #[test]
    fn test_timestamp_conversion() {
        assert_eq!(timestamp(None).unwrap(), None);
        assert_eq!(
            timestamp(Some(0)).unwrap(),
            Some(OffsetDateTime::UNIX_EPOCH)
        );
        assert!(timestamp(Some(i64::MAX)).is_err());
    }
}
