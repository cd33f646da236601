//! Postgres-backed billing store

use async_trait::async_trait;
use prepbuddy_shared::{PaymentRecord, SubscriptionRecord};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, NewPayment, NewSubscription, SubscriptionChanges, UpdateOutcome,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, stripe_customer_id, stripe_subscription_id, \
     plan_id, status, current_period_start, current_period_end, cancel_at_period_end, \
     trial_end, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, subscription_id, stripe_payment_intent_id, \
     stripe_invoice_id, amount, currency, status, description, created_at";

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    plan_id: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    trial_end: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            trial_end: row.trial_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    stripe_payment_intent_id: Option<String>,
    stripe_invoice_id: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    description: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            stripe_invoice_id: row.stripe_invoice_id,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

fn to_record(row: Option<SubscriptionRow>) -> BillingResult<Option<SubscriptionRecord>> {
    row.map(SubscriptionRecord::try_from).transpose()
}

/// Billing store on the `subscriptions`, `payment_history` and `webhook_events` tables
#[derive(Debug, Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn outcome_without_update(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<UpdateOutcome> {
        Ok(match self.find_by_stripe_subscription_id(stripe_subscription_id).await? {
            Some(record) => UpdateOutcome::Unchanged(record),
            None => UpdateOutcome::NotFound,
        })
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_subscription(
        &self,
        subscription: NewSubscription,
    ) -> BillingResult<SubscriptionRecord> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_customer_id, stripe_subscription_id, plan_id, status,
                current_period_start, current_period_end, cancel_at_period_end, trial_end,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (user_id, stripe_subscription_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                trial_end = EXCLUDED.trial_end,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: SubscriptionRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(subscription.user_id)
            .bind(&subscription.stripe_customer_id)
            .bind(&subscription.stripe_subscription_id)
            .bind(&subscription.plan_id)
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .bind(subscription.trial_end)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn update_subscription(
        &self,
        stripe_subscription_id: &str,
        changes: SubscriptionChanges,
    ) -> BillingResult<UpdateOutcome> {
        // Only touch rows whose values actually differ so replays keep updated_at
        let sql = format!(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                trial_end = $7,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND (
                plan_id IS DISTINCT FROM $2
                OR status IS DISTINCT FROM $3
                OR current_period_start IS DISTINCT FROM $4
                OR current_period_end IS DISTINCT FROM $5
                OR cancel_at_period_end IS DISTINCT FROM $6
                OR trial_end IS DISTINCT FROM $7
              )
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(stripe_subscription_id)
            .bind(&changes.plan_id)
            .bind(changes.status.as_str())
            .bind(changes.current_period_start)
            .bind(changes.current_period_end)
            .bind(changes.cancel_at_period_end)
            .bind(changes.trial_end)
            .fetch_optional(&self.pool)
            .await?;

        match to_record(row)? {
            Some(record) => Ok(UpdateOutcome::Updated(record)),
            None => self.outcome_without_update(stripe_subscription_id).await,
        }
    }

    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<UpdateOutcome> {
        let sql = format!(
            r#"
            UPDATE subscriptions SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND status <> 'canceled'
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        match to_record(row)? {
            Some(record) => Ok(UpdateOutcome::Updated(record)),
            None => self.outcome_without_update(stripe_subscription_id).await,
        }
    }

    async fn find_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1 \
             ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        to_record(row)
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_customer_id = $1 \
             ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;

        to_record(row)
    }

    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions \
             WHERE user_id = $1 AND status IN ('active', 'trialing') \
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        to_record(row)
    }

    async fn latest_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 \
             ORDER BY updated_at DESC, created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        to_record(row)
    }

    async fn customer_id_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let customer_id: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id FROM subscriptions
            WHERE user_id = $1 AND stripe_customer_id IS NOT NULL
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer_id.map(|(id,)| id))
    }

    async fn record_payment(&self, payment: NewPayment) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_history (
                id, user_id, subscription_id, stripe_payment_intent_id, stripe_invoice_id,
                amount, currency, status, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (stripe_invoice_id, status) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.subscription_id)
        .bind(&payment.stripe_payment_intent_id)
        .bind(&payment.stripe_invoice_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.description)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn payment_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_history WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
            PAYMENT_COLUMNS
        );

        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PaymentRecord::try_from).collect()
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> BillingResult<EventClaim> {
        // Failed deliveries and ones stuck in processing past the timeout can be retried
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (stripe_event_id, event_type, processing_result, received_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                error_message = NULL,
                received_at = NOW(),
                processed_at = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.received_at < NOW() - make_interval(mins => $3))
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((result,)) if result == "success" => EventClaim::AlreadyProcessed,
            _ => EventClaim::InProgress,
        })
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error: Option<String>,
    ) -> BillingResult<()> {
        let result = if error.is_some() { "error" } else { "success" };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepbuddy_shared::SubscriptionStatus;

    fn row(status: &str) -> SubscriptionRow {
        let now = OffsetDateTime::now_utc();
        SubscriptionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            stripe_customer_id: Some("cus_1".to_string()),
            stripe_subscription_id: Some("sub_1".to_string()),
            plan_id: "pro".to_string(),
            status: status.to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_conversion_parses_status() {
        let record = SubscriptionRecord::try_from(row("past_due")).unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_corrupt_status_is_a_database_error() {
        let err = SubscriptionRecord::try_from(row("gold")).unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
