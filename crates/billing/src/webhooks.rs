//! Stripe webhook handling
//!
//! The webhook handler is the only writer of subscription and payment rows.
//! Every delivery is signature-checked before anything is parsed or persisted,
//! claimed in the `webhook_events` ledger, then dispatched by event type.
//!
//! Events are parsed with our own lenient envelope rather than `stripe::Event`
//! so processor API-version drift does not break deliveries.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use prepbuddy_shared::{PaymentStatus, PlanCatalog};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{optional_expandable_id, timestamp, PaymentProcessor, ProcessorSubscription};
use crate::store::{
    BillingStore, EventClaim, NewPayment, NewSubscription, SubscriptionChanges, UpdateOutcome,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Event Envelope
// =============================================================================

/// A verified webhook delivery
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Event types the handler acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    CheckoutSessionCompleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other,
}

impl WebhookEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Other,
        }
    }
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookEventKind {
        WebhookEventKind::from_type(&self.event_type)
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayload(format!("{} object: {}", self.event_type, e))
        })
    }
}

/// What the handler did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State was written (or already matched the event)
    Processed,
    /// Acknowledged without acting
    Ignored,
    /// Seen before; nothing was re-applied
    Duplicate,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    customer: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    subscription: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl CheckoutSessionObject {
    fn user_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .map(String::as_str)
            .or(self.client_reference_id.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    customer: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    subscription: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    lines: Option<InvoiceLines>,
    #[serde(default)]
    parent: Option<InvoiceParent>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    description: Option<String>,
}

// Newer API versions move the subscription under parent.subscription_details
#[derive(Debug, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSubscriptionDetails {
    #[serde(default, deserialize_with = "optional_expandable_id")]
    subscription: Option<String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl InvoiceObject {
    fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    fn description(&self) -> Option<String> {
        self.description.clone().or_else(|| {
            self.lines
                .as_ref()
                .and_then(|lines| lines.data.first())
                .and_then(|line| line.description.clone())
        })
    }
}

// =============================================================================
// Signatures
// =============================================================================

/// Build a `Stripe-Signature` header value for a payload.
///
/// Used for local replay tooling and tests.
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn verify_signature(secret: &str, payload: &str, header: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        tracing::warn!("Missing timestamp in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    };

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let within_tolerance = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|skew| skew <= SIGNATURE_TOLERANCE_SECS.unsigned_abs());
    if !within_tolerance {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    // Any matching v1 passes so the secret can be rolled
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            store,
            catalog,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// [`Self::verify_event`] against an explicit clock
    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        verify_signature(&self.webhook_secret, payload, signature, now)?;

        serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayload(format!("Invalid event envelope: {}", e)))
    }

    /// Process a verified event, at most once per event id
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match self
            .store
            .claim_webhook_event(&event.id, &event.event_type)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::AlreadyProcessed => {
                tracing::info!(event_id = %event.id, "Webhook event already processed, skipping");
                return Ok(WebhookOutcome::Duplicate);
            }
            EventClaim::InProgress => {
                tracing::info!(event_id = %event.id, "Webhook event is being processed elsewhere, skipping");
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process_event(event).await;

        let error = result.as_ref().err().map(ToString::to_string);
        if let Err(e) = self.store.finish_webhook_event(&event.id, error).await {
            tracing::error!(event_id = %event.id, error = %e, "Failed to record webhook result");
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
        }

        result
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.kind() {
            WebhookEventKind::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event.object()?).await
            }
            WebhookEventKind::InvoicePaymentSucceeded => {
                self.handle_invoice(event.object()?, PaymentStatus::Succeeded).await
            }
            WebhookEventKind::InvoicePaymentFailed => {
                self.handle_invoice(event.object()?, PaymentStatus::Failed).await
            }
            WebhookEventKind::SubscriptionUpdated => {
                self.handle_subscription_updated(event.object()?).await
            }
            WebhookEventKind::SubscriptionDeleted => {
                self.handle_subscription_deleted(event.object()?).await
            }
            WebhookEventKind::Other => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        session: CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let Some(subscription_id) = session.subscription.as_deref() else {
            tracing::info!(session_id = %session.id, "Checkout session without subscription, ignoring");
            return Ok(WebhookOutcome::Ignored);
        };

        let subscription = self.processor.retrieve_subscription(subscription_id).await?;

        // Checkout copies user_id onto the subscription too
        let user_id = session
            .user_id()
            .or_else(|| subscription.metadata_value("user_id"))
            .ok_or_else(|| {
                BillingError::WebhookPayload(format!("Checkout session {} has no user_id", session.id))
            })
            .and_then(|raw| {
                Uuid::parse_str(raw).map_err(|_| {
                    BillingError::WebhookPayload(format!("Invalid user_id in session {}", session.id))
                })
            })?;
        let plan_id = self
            .catalog
            .plan_id_for_price_or_free(subscription.price_id())
            .to_string();

        let record = self
            .store
            .upsert_subscription(NewSubscription {
                user_id,
                stripe_customer_id: session
                    .customer
                    .clone()
                    .unwrap_or_else(|| subscription.customer.clone()),
                stripe_subscription_id: subscription.id.clone(),
                plan_id,
                status: subscription.status(),
                current_period_start: timestamp(subscription.period_start())?,
                current_period_end: timestamp(subscription.period_end())?,
                cancel_at_period_end: subscription.cancel_at_period_end,
                trial_end: timestamp(subscription.trial_end)?,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan_id = %record.plan_id,
            status = %record.status,
            "Subscription created from checkout"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice(
        &self,
        invoice: InvoiceObject,
        status: PaymentStatus,
    ) -> BillingResult<WebhookOutcome> {
        let mut owner = match invoice.subscription_id() {
            Some(sub_id) => self.store.find_by_stripe_subscription_id(sub_id).await?,
            None => None,
        };
        if owner.is_none() {
            if let Some(customer_id) = invoice.customer.as_deref() {
                owner = self.store.find_by_customer_id(customer_id).await?;
            }
        }

        // Invoices can arrive before checkout completes; fail so the processor retries
        let owner = owner.ok_or_else(|| {
            BillingError::SubscriptionNotFound(format!(
                "No subscription for invoice {}",
                invoice.id
            ))
        })?;

        let amount = match status {
            PaymentStatus::Succeeded => invoice.amount_paid,
            _ => invoice.amount_due,
        };

        let inserted = self
            .store
            .record_payment(NewPayment {
                user_id: owner.user_id,
                subscription_id: Some(owner.id),
                stripe_payment_intent_id: invoice.payment_intent.clone(),
                stripe_invoice_id: Some(invoice.id.clone()),
                amount,
                currency: invoice.currency.to_lowercase(),
                status,
                description: invoice.description(),
            })
            .await?;

        if !inserted {
            tracing::info!(invoice_id = %invoice.id, "Invoice already recorded");
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            user_id = %owner.user_id,
            invoice_id = %invoice.id,
            amount = amount,
            status = %status,
            "Recorded invoice payment"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_updated(
        &self,
        subscription: ProcessorSubscription,
    ) -> BillingResult<WebhookOutcome> {
        let changes = SubscriptionChanges {
            plan_id: self
                .catalog
                .plan_id_for_price_or_free(subscription.price_id())
                .to_string(),
            status: subscription.status(),
            current_period_start: timestamp(subscription.period_start())?,
            current_period_end: timestamp(subscription.period_end())?,
            cancel_at_period_end: subscription.cancel_at_period_end,
            trial_end: timestamp(subscription.trial_end)?,
        };

        match self
            .store
            .update_subscription(&subscription.id, changes)
            .await?
        {
            UpdateOutcome::Updated(record) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    plan_id = %record.plan_id,
                    status = %record.status,
                    cancel_at_period_end = record.cancel_at_period_end,
                    "Subscription updated"
                );
                Ok(WebhookOutcome::Processed)
            }
            UpdateOutcome::Unchanged(_) => {
                tracing::debug!(subscription_id = %subscription.id, "Subscription already up to date");
                Ok(WebhookOutcome::Processed)
            }
            UpdateOutcome::NotFound => {
                tracing::warn!(subscription_id = %subscription.id, "Update for unknown subscription");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: ProcessorSubscription,
    ) -> BillingResult<WebhookOutcome> {
        match self
            .store
            .mark_subscription_canceled(&subscription.id)
            .await?
        {
            UpdateOutcome::Updated(record) => {
                tracing::info!(
                    user_id = %record.user_id,
                    subscription_id = %subscription.id,
                    "Subscription canceled"
                );
                Ok(WebhookOutcome::Processed)
            }
            UpdateOutcome::Unchanged(_) => Ok(WebhookOutcome::Processed),
            UpdateOutcome::NotFound => {
                tracing::warn!(subscription_id = %subscription.id, "Deletion for unknown subscription");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }
}
