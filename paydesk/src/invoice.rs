//! Invoice records and the status-update contract.
//!
//! Invoices are owned by the external invoicing service. The payment flow reads the total and
//! customer contact, and at the end of a successful payment writes the new status together
//! with the processor correlation. Only `pending → processing` and `pending → paid` are ever
//! written from here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::backend::{BackendError, ensure_slash};
use crate::payment_providers::{PaymentOutcome, SettlementStatus};
use crate::types::{InvoiceId, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    Paid,
    Overdue,
    Refunded,
    PartiallyRefunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Refunded => "refunded",
            InvoiceStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    /// The only transitions a payment may perform: pending to processing or paid.
    pub fn can_settle_to(&self, next: InvoiceStatus) -> bool {
        matches!(
            (self, next),
            (InvoiceStatus::Pending, InvoiceStatus::Processing) | (InvoiceStatus::Pending, InvoiceStatus::Paid)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SettlementStatus> for InvoiceStatus {
    fn from(status: SettlementStatus) -> Self {
        match status {
            SettlementStatus::Paid => InvoiceStatus::Paid,
            SettlementStatus::Processing => InvoiceStatus::Processing,
        }
    }
}

/// Which processor handled the payment, and its transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCorrelation {
    pub provider: ProviderId,
    pub charge_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: InvoiceId,
    pub total: Decimal,
    pub status: InvoiceStatus,
    /// Email or customer reference passed through to the processors
    pub customer_contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<PaymentCorrelation>,
}

/// Status write sent to the invoicing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatusUpdate {
    pub invoice_id: InvoiceId,
    pub status: InvoiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub correlation: PaymentCorrelation,
}

impl InvoiceStatusUpdate {
    /// Build the update recording `outcome` against `invoice`.
    ///
    /// `paid_at` is only set when the money has settled.
    pub fn for_outcome(invoice: &Invoice, outcome: &PaymentOutcome, now: DateTime<Utc>) -> Result<Self, InvoiceError> {
        let status = InvoiceStatus::from(outcome.status);
        if !invoice.status.can_settle_to(status) {
            return Err(InvoiceError::IllegalTransition {
                from: invoice.status,
                to: status,
            });
        }

        Ok(Self {
            invoice_id: invoice.id,
            status,
            paid_at: (status == InvoiceStatus::Paid).then_some(now),
            correlation: PaymentCorrelation {
                provider: outcome.provider,
                charge_id: outcome.transaction_id.clone(),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvoiceError {
    #[error("Invoice cannot move from {from} to {to}")]
    IllegalTransition { from: InvoiceStatus, to: InvoiceStatus },

    #[error("Invoicing service rejected the status update")]
    Rejected,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Persists invoice status changes.
#[async_trait]
pub trait InvoiceStatusUpdater: Send + Sync {
    async fn update_status(&self, update: &InvoiceStatusUpdate) -> Result<(), InvoiceError>;
}

#[derive(Debug, Deserialize)]
struct UpdateStatusResponse {
    success: bool,
}

/// reqwest implementation of `InvoiceStatusUpdater` against the invoicing API.
pub struct HttpInvoiceApi {
    client: Client,
    base_url: Url,
}

impl HttpInvoiceApi {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: ensure_slash(&base_url),
        })
    }
}

#[async_trait]
impl InvoiceStatusUpdater for HttpInvoiceApi {
    #[instrument(skip(self, update), fields(invoice_id = %update.invoice_id, status = %update.status), err)]
    async fn update_status(&self, update: &InvoiceStatusUpdate) -> Result<(), InvoiceError> {
        let url = self
            .base_url
            .join(&format!("invoices/{}/status", update.invoice_id))
            .map_err(BackendError::from)?;

        let response = self.client.patch(url).json(update).send().await.map_err(BackendError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let body: UpdateStatusResponse = response.json().await.map_err(BackendError::from)?;
        if !body.success {
            return Err(InvoiceError::Rejected);
        }
        Ok(())
    }
}
