//! Payment backend contracts.
//!
//! The dashboard's own backend brokers every call that needs a processor secret: creating and
//! re-pricing Stripe sessions, charging Square tokens, and reporting which processors are
//! connected. This module defines the `PaymentBackend` trait over those calls, and
//! `HttpPaymentBackend`, the reqwest implementation used in production.
//!
//! All amounts on the wire are integer minor units (cents).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::types::{InvoiceId, MethodKind};

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur talking to the payment backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Payment backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Payment backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid payment backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl BackendError {
    /// A message fit for the operator, if the backend supplied one.
    ///
    /// Error bodies are expected to look like `{"message": "..."}` or `{"error": "..."}`.
    pub fn user_message(&self) -> Option<String> {
        match self {
            BackendError::Status { body, .. } => {
                let value: serde_json::Value = serde_json::from_str(body).ok()?;
                ["message", "error"]
                    .iter()
                    .find_map(|key| value.get(key).and_then(|v| v.as_str()))
                    .filter(|message| !message.trim().is_empty())
                    .map(str::to_string)
            }
            BackendError::Transport(_) | BackendError::InvalidUrl(_) => None,
        }
    }
}

/// Create session (Stripe)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Amount to charge, fee included
    pub amount: i64,
    /// Invoice total without the fee, kept by the backend for audit
    pub reference_amount: i64,
    pub invoice_id: InvoiceId,
    pub customer_contact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_secret: String,
    pub session_id: String,
}

/// Update session amount (Stripe)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionAmountRequest {
    pub session_id: String,
    pub new_amount: i64,
    pub reference_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionAmountResponse {
    pub success: bool,
}

/// Charge by token (Square)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub amount: i64,
    pub token: String,
    pub invoice_id: InvoiceId,
    pub customer_contact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub success: bool,
    #[serde(default)]
    pub charge_id: Option<String>,
    /// Processor-side payment status, e.g. `COMPLETED` or `PENDING`
    #[serde(default)]
    pub status: Option<String>,
    /// Processor error text on failure
    #[serde(default)]
    pub message: Option<String>,
}

/// Which processors the account has connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectivityStatus {
    #[serde(rename = "providerAConnected", default)]
    pub stripe_connected: bool,
    #[serde(rename = "providerBConnected", default)]
    pub square_connected: bool,
    /// Square capabilities enabled on the account, e.g. `google_pay`, `apple_pay`, `ach`
    #[serde(rename = "providerBCapabilityIds", default)]
    pub square_capabilities: Vec<String>,
}

impl ConnectivityStatus {
    /// Whether the Square account reports the capability needed for `kind`. Card is always on.
    pub fn square_supports(&self, kind: MethodKind) -> bool {
        match kind {
            MethodKind::Card => true,
            kind => self.square_capabilities.iter().any(|id| MethodKind::from_reported(id) == kind),
        }
    }
}

/// Backend calls the payment flow depends on.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    /// Create a Stripe payment session for an invoice.
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<CreateSessionResponse>;

    /// Re-price an existing Stripe session after the fee changed.
    async fn update_session_amount(&self, request: &UpdateSessionAmountRequest) -> Result<UpdateSessionAmountResponse>;

    /// Charge a Square payment token.
    async fn charge_by_token(&self, request: &ChargeRequest) -> Result<ChargeResponse>;

    /// Report which processors are connected.
    async fn connectivity_status(&self) -> Result<ConnectivityStatus>;
}

/// Makes sure a url has a trailing slash, so that `join` appends rather than replaces.
pub(crate) fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

/// The concrete implementation of `PaymentBackend`.
pub struct HttpPaymentBackend {
    client: Client,
    base_url: Url,
}

impl HttpPaymentBackend {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: ensure_slash(&base_url),
        })
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path)?;
        debug!("POST {}", url);
        let response = self.client.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Payment backend returned {}: {}", status, body);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PaymentBackend for HttpPaymentBackend {
    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id, amount = request.amount), err)]
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<CreateSessionResponse> {
        self.post("payments/stripe/sessions", request).await
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, amount = request.new_amount), err)]
    async fn update_session_amount(&self, request: &UpdateSessionAmountRequest) -> Result<UpdateSessionAmountResponse> {
        let path = format!("payments/stripe/sessions/{}/amount", request.session_id);
        self.post(&path, request).await
    }

    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id, amount = request.amount), err)]
    async fn charge_by_token(&self, request: &ChargeRequest) -> Result<ChargeResponse> {
        self.post("payments/square/charges", request).await
    }

    #[instrument(skip(self), err)]
    async fn connectivity_status(&self) -> Result<ConnectivityStatus> {
        let url = self.base_url.join("payments/providers/status")?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer) -> HttpPaymentBackend {
        // no trailing slash, ensure_slash must fix it up
        let base = Url::parse(&format!("{}/api", server.uri())).unwrap();
        HttpPaymentBackend::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_ensure_slash() {
        let url = Url::parse("http://localhost/api").unwrap();
        assert_eq!(ensure_slash(&url).join("x").unwrap().as_str(), "http://localhost/api/x");
        let url = Url::parse("http://localhost/api/").unwrap();
        assert_eq!(ensure_slash(&url).as_str(), "http://localhost/api/");
    }

    #[tokio::test]
    async fn test_create_session_wire_format() {
        let server = MockServer::start().await;
        let invoice_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/api/payments/stripe/sessions"))
            .and(body_json(serde_json::json!({
                "amount": 10400,
                "referenceAmount": 10000,
                "invoiceId": invoice_id,
                "customerContact": "billing@example.com"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessionSecret": "pi_123_secret_abc",
                "sessionId": "pi_123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let response = backend
            .create_session(&CreateSessionRequest {
                amount: 10400,
                reference_amount: 10000,
                invoice_id,
                customer_contact: "billing@example.com".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(response.session_id, "pi_123");
        assert_eq!(response.session_secret, "pi_123_secret_abc");
    }

    #[tokio::test]
    async fn test_update_session_amount_posts_to_session_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payments/stripe/sessions/pi_123/amount"))
            .and(body_json(serde_json::json!({
                "sessionId": "pi_123",
                "newAmount": 20300,
                "referenceAmount": 20000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let response = backend
            .update_session_amount(&UpdateSessionAmountRequest {
                session_id: "pi_123".to_string(),
                new_amount: 20300,
                reference_amount: 20000,
            })
            .await
            .unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_charge_failure_keeps_processor_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payments/square/charges"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "message": "Card declined"
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let response = backend
            .charge_by_token(&ChargeRequest {
                amount: 10400,
                token: "cnon:abc".to_string(),
                invoice_id: Uuid::new_v4(),
                customer_contact: "billing@example.com".to_string(),
            })
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.charge_id, None);
        assert_eq!(response.message.as_deref(), Some("Card declined"));
    }

    #[tokio::test]
    async fn test_error_status_exposes_user_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payments/stripe/sessions"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({ "error": "Stripe account is restricted" })))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let err = backend
            .create_session(&CreateSessionRequest {
                amount: 100,
                reference_amount: 100,
                invoice_id: Uuid::new_v4(),
                customer_contact: String::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Status { status: 422, .. }));
        assert_eq!(err.user_message().as_deref(), Some("Stripe account is restricted"));
    }

    #[tokio::test]
    async fn test_connectivity_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments/providers/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "providerAConnected": false,
                "providerBConnected": true,
                "providerBCapabilityIds": ["google_pay", "ach"]
            })))
            .mount(&server)
            .await;

        let status = backend_for(&server).connectivity_status().await.unwrap();
        assert!(!status.stripe_connected);
        assert!(status.square_connected);
        assert!(status.square_supports(MethodKind::Card));
        assert!(status.square_supports(MethodKind::Wallet));
        assert!(status.square_supports(MethodKind::BankDebit));
    }

    #[test]
    fn test_square_supports_without_capabilities() {
        let status = ConnectivityStatus {
            square_connected: true,
            ..Default::default()
        };
        assert!(status.square_supports(MethodKind::Card));
        assert!(!status.square_supports(MethodKind::Wallet));
        assert!(!status.square_supports(MethodKind::BankDebit));
    }

    #[test]
    fn test_user_message_ignores_non_json_bodies() {
        let err = BackendError::Status {
            status: 502,
            body: "<html>bad gateway</html>".to_string(),
        };
        assert_eq!(err.user_message(), None);
    }
}
