//! HTTP calls to the PrepBuddy billing API

use std::time::Duration;

use prepbuddy_shared::{Entitlement, PaymentRecord, SubscriptionRecord};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<SubscriptionRecord>,
    pub entitlement: Entitlement,
}

#[derive(Debug, Deserialize)]
struct PaymentsResponse {
    payments: Vec<PaymentRecord>,
}

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest<'a> {
    pub price_id: &'a str,
    pub user_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest<'a> {
    pub customer_id: &'a str,
    pub return_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Thin typed wrapper over the billing endpoints
#[derive(Debug, Clone)]
pub struct BillingApi {
    http: Client,
    config: ClientConfig,
}

impl BillingApi {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn get_subscription(&self, token: &str) -> ClientResult<SubscriptionResponse> {
        let request = self.http.get(self.config.endpoint("/billing/subscription"));
        let response = send(request, token).await?;
        Ok(response.json().await?)
    }

    pub async fn list_payments(&self, token: &str, limit: i64) -> ClientResult<Vec<PaymentRecord>> {
        let request = self
            .http
            .get(self.config.endpoint("/billing/payments"))
            .query(&[("limit", limit)]);
        let response = send(request, token).await?;
        let body: PaymentsResponse = response.json().await?;
        Ok(body.payments)
    }

    pub async fn create_checkout(&self, token: &str, body: &CheckoutRequest<'_>) -> ClientResult<String> {
        let request = self
            .http
            .post(self.config.endpoint("/billing/checkout"))
            .json(body);
        let response = send(request, token).await?;
        let body: UrlResponse = response.json().await?;
        Ok(body.url)
    }

    pub async fn create_portal(&self, token: &str, body: &PortalRequest<'_>) -> ClientResult<String> {
        let request = self
            .http
            .post(self.config.endpoint("/billing/portal"))
            .json(body);
        let response = send(request, token).await?;
        let body: UrlResponse = response.json().await?;
        Ok(body.url)
    }

    pub async fn cancel_subscription(&self, token: &str) -> ClientResult<()> {
        let request = self.http.post(self.config.endpoint("/billing/cancel"));
        send(request, token).await?;
        Ok(())
    }
}

async fn send(request: RequestBuilder, token: &str) -> ClientResult<Response> {
    let response = request.bearer_auth(token).send().await?;
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    Err(api_error(status, &text))
}

/// Map an error response onto a [`ClientError`]
fn api_error(status: u16, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => match error.code.as_str() {
            "NO_CUSTOMER" => ClientError::NoCustomer,
            "NO_ACTIVE_SUBSCRIPTION" => ClientError::NoActiveSubscription,
            "UNAUTHORIZED" | "INVALID_TOKEN" => ClientError::NotAuthenticated,
            _ => ClientError::Api {
                status,
                code: error.code,
                message: error.message,
            },
        },
        Err(_) => ClientError::Api {
            status,
            code: "UNKNOWN".to_string(),
            message: format!("Request failed with status {}", status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_codes() {
        let body = r#"{"error":{"code":"NO_CUSTOMER","message":"No billing account"}}"#;
        assert!(matches!(api_error(404, body), ClientError::NoCustomer));

        let body = r#"{"error":{"code":"INVALID_TOKEN","message":"Invalid or expired token"}}"#;
        assert!(matches!(api_error(401, body), ClientError::NotAuthenticated));

        let body = r#"{"error":{"code":"PAYMENT_PROVIDER_ERROR","message":"Payment provider request failed"}}"#;
        match api_error(502, body) {
            ClientError::Api { status, code, message } => {
                assert_eq!(status, 502);
                assert_eq!(code, "PAYMENT_PROVIDER_ERROR");
                assert_eq!(message, "Payment provider request failed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_without_json_body() {
        match api_error(503, "<html>Bad Gateway</html>") {
            ClientError::Api { status, code, .. } => {
                assert_eq!(status, 503);
                assert_eq!(code, "UNKNOWN");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
