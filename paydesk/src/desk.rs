//! Entry point for taking invoice payments.

use bon::Builder;
use std::sync::Arc;

use crate::{
    backend::{BackendError, HttpPaymentBackend, PaymentBackend},
    config::Config,
    fees::FeeSchedule,
    flow::{FlowParts, PaymentFlow},
    invoice::{HttpInvoiceApi, Invoice, InvoiceStatus, InvoiceStatusUpdater},
    payment_providers::{
        PaymentOutcome, ProviderSurfaces,
        square::{ScriptHost, ScriptLoader, SquareApplication, SquareRuntime},
        stripe::HostedElementsFactory,
    },
    selector::ProviderSelection,
    types::{ProviderId, abbrev_uuid},
};

/// Reasons a payment flow cannot be opened.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Invoice is already paid")]
    AlreadyPaid,

    #[error("Invoice is {status} and cannot be paid")]
    NotPayable { status: InvoiceStatus },

    #[error("No payment processor is connected. Connect Stripe or Square in settings to accept payments.")]
    NoProviderConnected,

    #[error("Could not check payment processor status: {0}")]
    Connectivity(#[source] BackendError),
}

/// Opens payment flows for invoices.
///
/// # Example
///
/// ```ignore
/// let desk = PaymentDesk::builder()
///     .backend(backend)
///     .invoices(invoice_api)
///     .surfaces(surfaces)
///     .build();
/// let flow = desk.open_payment_flow(invoice, |outcome| println!("paid {}", outcome.amount)).await?;
/// ```
#[derive(Clone, Builder)]
pub struct PaymentDesk {
    pub backend: Arc<dyn PaymentBackend>,
    pub invoices: Arc<dyn InvoiceStatusUpdater>,
    #[builder(default)]
    pub surfaces: ProviderSurfaces,
    #[builder(default = Arc::new(FeeSchedule::default()))]
    pub fees: Arc<FeeSchedule>,
    #[builder(default = ProviderId::Stripe)]
    pub default_provider: ProviderId,
}

impl PaymentDesk {
    /// Wire the HTTP adapters from configuration.
    ///
    /// Square is only offered when it is configured and the embedder can host its script.
    pub fn from_config(
        config: &Config,
        stripe: Option<Arc<dyn HostedElementsFactory>>,
        script_host: Option<Arc<dyn ScriptHost>>,
    ) -> Result<Self, BackendError> {
        let backend = HttpPaymentBackend::new(config.backend.base_url.clone(), config.backend.request_timeout)?;
        let invoices = HttpInvoiceApi::new(config.invoice_api_url().clone(), config.backend.request_timeout)?;

        let square = match (&config.square, script_host) {
            (Some(square), Some(host)) => {
                let loader = ScriptLoader::new(host, square.script_url.clone(), square.script_load_timeout);
                Some(SquareRuntime::new(
                    Arc::new(loader),
                    SquareApplication {
                        application_id: square.application_id.clone(),
                        location_id: square.location_id.clone(),
                    },
                ))
            }
            (Some(_), None) => {
                tracing::warn!("Square is configured but no script host was provided, Square will not be offered");
                None
            }
            (None, _) => None,
        };

        Ok(Self::builder()
            .backend(Arc::new(backend))
            .invoices(Arc::new(invoices))
            .surfaces(ProviderSurfaces { stripe, square })
            .fees(Arc::new(config.fees.clone()))
            .default_provider(config.default_provider)
            .build())
    }

    /// Open a payment flow for `invoice`.
    ///
    /// When only one processor is usable its session is initialized before this returns; the
    /// flow is then either `Ready` or in `SetupError`. `on_complete` fires once, after a
    /// successful payment has been recorded against the invoice.
    pub async fn open_payment_flow<F>(&self, invoice: Invoice, on_complete: F) -> Result<PaymentFlow, OpenError>
    where
        F: FnOnce(&PaymentOutcome) + Send + 'static,
    {
        match invoice.status {
            InvoiceStatus::Pending => {}
            InvoiceStatus::Paid => return Err(OpenError::AlreadyPaid),
            status => return Err(OpenError::NotPayable { status }),
        }

        let connectivity = self.backend.connectivity_status().await.map_err(|e| {
            tracing::error!("Failed to fetch processor connectivity: {}", e);
            OpenError::Connectivity(e)
        })?;

        let selection = ProviderSelection::from_connectivity(&connectivity, self.default_provider, &self.surfaces);
        let implied = match selection {
            ProviderSelection::NoProviderConnected => return Err(OpenError::NoProviderConnected),
            ProviderSelection::SingleProviderImplied { provider } => Some(provider),
            ProviderSelection::ChoiceRequired { .. } => None,
        };

        let flow = PaymentFlow::new(FlowParts {
            invoice,
            selection,
            connectivity,
            fees: self.fees.clone(),
            backend: self.backend.clone(),
            invoices: self.invoices.clone(),
            surfaces: self.surfaces.clone(),
            on_complete: Box::new(on_complete),
        });
        tracing::info!(
            flow_id = %abbrev_uuid(&flow.id()),
            invoice_id = %abbrev_uuid(&flow.invoice().id),
            selection = ?selection,
            "Opened payment flow"
        );

        if let Some(provider) = implied {
            // A failure leaves the flow in SetupError for the caller to render
            if let Err(e) = flow.choose_provider(provider).await {
                tracing::warn!(provider = %provider, error = %e, "Implied provider failed to initialize");
            }
        }

        Ok(flow)
    }
}
