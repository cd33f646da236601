//! Payment history reads and CSV export

use std::sync::Arc;

use prepbuddy_shared::PaymentRecord;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingStore, PAYMENT_HISTORY_LIMIT};

/// Service for reading and exporting payment history
pub struct PaymentHistoryService {
    store: Arc<dyn BillingStore>,
}

impl PaymentHistoryService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Most recent payments, newest first. `limit` is clamped to 1..=50.
    pub async fn recent_payments(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let limit = limit
            .unwrap_or(PAYMENT_HISTORY_LIMIT)
            .clamp(1, PAYMENT_HISTORY_LIMIT);
        self.store.payment_history(user_id, limit).await
    }

    /// Export the user's payment history to CSV
    pub async fn export_csv(&self, user_id: Uuid) -> BillingResult<String> {
        let records = self.recent_payments(user_id, None).await?;

        let mut csv = String::new();
        csv.push_str("Date,Description,Amount,Currency,Status,Invoice\n");

        for record in records {
            let date = record
                .created_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| "unknown".to_string());

            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                date,
                escape_csv_field(record.description.as_deref().unwrap_or_default()),
                decimal_amount(record.amount),
                record.currency.to_uppercase(),
                record.status,
                escape_csv_field(record.stripe_invoice_id.as_deref().unwrap_or_default()),
            ));
        }

        Ok(csv)
    }
}

/// Minor units as a plain two-decimal number
fn decimal_amount(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBillingStore, NewPayment};
    use prepbuddy_shared::PaymentStatus;

    async fn seeded(user: Uuid, count: usize) -> Arc<MemoryBillingStore> {
        let store = Arc::new(MemoryBillingStore::new());
        for i in 0..count {
            store
                .record_payment(NewPayment {
                    user_id: user,
                    subscription_id: None,
                    stripe_payment_intent_id: None,
                    stripe_invoice_id: Some(format!("in_{}", i)),
                    amount: 999,
                    currency: "usd".to_string(),
                    status: PaymentStatus::Succeeded,
                    description: Some("Pro, monthly".to_string()),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_recent_payments_limit_is_clamped() {
        let user = Uuid::new_v4();
        let service = PaymentHistoryService::new(seeded(user, 60).await);

        assert_eq!(service.recent_payments(user, None).await.unwrap().len(), 50);
        assert_eq!(service.recent_payments(user, Some(500)).await.unwrap().len(), 50);
        assert_eq!(service.recent_payments(user, Some(0)).await.unwrap().len(), 1);
        assert_eq!(service.recent_payments(user, Some(5)).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_export_csv() {
        let user = Uuid::new_v4();
        let service = PaymentHistoryService::new(seeded(user, 1).await);

        let csv = service.export_csv(user).await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Date,Description,Amount,Currency,Status,Invoice");
        assert!(lines[1].ends_with(",\"Pro, monthly\",9.99,USD,succeeded,in_0"));
    }

    #[test]
    fn test_decimal_amount() {
        assert_eq!(decimal_amount(0), "0.00");
        assert_eq!(decimal_amount(999), "9.99");
        assert_eq!(decimal_amount(-1050), "-10.50");
        assert_eq!(decimal_amount(123456), "1234.56");
    }

    #[test]
    fn test_escape_csv_field() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
