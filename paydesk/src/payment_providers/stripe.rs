//! Stripe session handle (hosted elements)
//!
//! The backend creates a payment session priced at the default method kind; the hosted
//! multi-method element is mounted with the session secret. Whenever the element reports a
//! different method type the fee is recomputed locally and the remote amount is re-synced in
//! the background. Confirmation happens inside the hosted element, and the processor charges
//! whatever amount the session holds at that point.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    backend::{CreateSessionRequest, UpdateSessionAmountRequest},
    payment_providers::{
        MethodKindCatalog, PaymentDetails, PaymentOutcome, PaymentSession, ProviderSessionHandle, Reconciler, ReconciliationState, Result,
        SessionContext, SessionError, SettlementStatus, SurfaceError,
    },
    types::{MethodKind, ProviderId, to_minor_units},
};

const STRIPE_METHOD_KINDS: [MethodKind; 3] = [MethodKind::Card, MethodKind::BankDebit, MethodKind::Wallet];

/// Outcome of confirming through the hosted element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmResult {
    Succeeded { payment_id: String },
    /// Accepted but settling asynchronously (bank debits)
    Processing { payment_id: String },
    Failed(SurfaceError),
}

/// The hosted multi-method input element, as mounted by the embedding UI.
#[async_trait]
pub trait HostedElements: Send + Sync {
    /// Mount the element bound to the session `client_secret`.
    async fn mount(&self, client_secret: &str) -> std::result::Result<(), SurfaceError>;

    async fn confirm(&self) -> ConfirmResult;

    /// Detach the element from the page. Must tolerate being called more than once.
    fn unmount(&self);
}

/// Creates a fresh hosted element per payment attempt.
pub trait HostedElementsFactory: Send + Sync {
    fn create(&self) -> Box<dyn HostedElements>;
}

struct StripeState {
    session: PaymentSession,
    mounted: bool,
}

/// Stripe implementation of [`ProviderSessionHandle`]
pub struct StripeSession {
    context: SessionContext,
    elements: Box<dyn HostedElements>,
    state: Mutex<StripeState>,
    reconciler: Arc<Reconciler>,
    torn_down: AtomicBool,
}

impl StripeSession {
    pub fn new(context: SessionContext, elements: Box<dyn HostedElements>) -> Self {
        let session = PaymentSession::new(ProviderId::Stripe, context.invoice_total, &context.fees);
        Self {
            context,
            elements,
            state: Mutex::new(StripeState { session, mounted: false }),
            reconciler: Arc::new(Reconciler::default()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Entry point for the hosted element's change event, which reports raw method types.
    pub async fn on_element_change(&self, reported_type: &str) -> Result<()> {
        self.on_method_kind_change(MethodKind::from_reported(reported_type)).await
    }

    pub fn reconciliation(&self) -> ReconciliationState {
        self.reconciler.state()
    }

    fn minor_units(amount: rust_decimal::Decimal) -> Result<i64> {
        to_minor_units(amount).ok_or_else(|| SessionError::setup(format!("Amount {amount} is out of range")))
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderSessionHandle for StripeSession {
    fn provider(&self) -> ProviderId {
        ProviderId::Stripe
    }

    fn session(&self) -> PaymentSession {
        self.state.lock().session.clone()
    }

    fn catalog(&self) -> MethodKindCatalog {
        MethodKindCatalog::available(&STRIPE_METHOD_KINDS)
    }

    async fn initialize(&self) -> Result<()> {
        let (amount, reference_amount) = {
            let state = self.state.lock();
            (Self::minor_units(state.session.grand_total)?, Self::minor_units(state.session.invoice_total)?)
        };

        let request = CreateSessionRequest {
            amount,
            reference_amount,
            invoice_id: self.context.invoice_id,
            customer_contact: self.context.customer_contact.clone(),
        };

        let created = self.context.backend.create_session(&request).await.map_err(|e| {
            tracing::error!("Failed to create Stripe session for invoice {}: {}", self.context.invoice_id, e);
            SessionError::setup(e.user_message().unwrap_or_else(|| "Unable to start the card payment session".to_string()))
        })?;

        if self.is_torn_down() {
            return Err(SessionError::setup("Payment session was closed"));
        }

        {
            let mut state = self.state.lock();
            state.session.session_id = Some(created.session_id.clone());
            state.session.session_secret = Some(created.session_secret.clone());
        }

        if let Err(e) = self.elements.mount(&created.session_secret).await {
            tracing::error!("Failed to mount Stripe elements for session {}: {}", created.session_id, e);
            // A failed mount may leave a partial element behind
            self.elements.unmount();
            return Err(SessionError::setup(e.to_string()));
        }

        let mut state = self.state.lock();
        if self.is_torn_down() {
            drop(state);
            self.elements.unmount();
            return Err(SessionError::setup("Payment session was closed"));
        }
        state.mounted = true;

        tracing::info!("Stripe session {} ready for invoice {}", created.session_id, self.context.invoice_id);
        Ok(())
    }

    async fn on_method_kind_change(&self, kind: MethodKind) -> Result<()> {
        let (request, amount) = {
            let mut state = self.state.lock();
            if !state.mounted {
                return Err(SessionError::NotReady);
            }
            if state.session.method_kind == kind {
                return Ok(());
            }
            let Some(session_id) = state.session.session_id.clone() else {
                return Err(SessionError::NotReady);
            };
            state.session.reprice(kind, &self.context.fees);

            let request = UpdateSessionAmountRequest {
                session_id,
                new_amount: Self::minor_units(state.session.grand_total)?,
                reference_amount: Self::minor_units(state.session.invoice_total)?,
            };
            (request, state.session.grand_total)
        };

        let generation = self.reconciler.begin(kind, amount);
        let backend = self.context.backend.clone();
        let reconciler = self.reconciler.clone();

        // Not awaited; a submit may race this call
        tokio::spawn(async move {
            let succeeded = match backend.update_session_amount(&request).await {
                Ok(response) if response.success => true,
                Ok(_) => {
                    tracing::warn!("Backend declined to update amount on session {}", request.session_id);
                    false
                }
                Err(e) => {
                    tracing::warn!("Failed to update amount on session {}: {}", request.session_id, e);
                    false
                }
            };
            reconciler.finish(generation, kind, amount, succeeded);
        });

        Ok(())
    }

    async fn submit(&self, _details: &PaymentDetails) -> Result<PaymentOutcome> {
        if !self.state.lock().mounted || self.is_torn_down() {
            return Err(SessionError::NotReady);
        }

        let result = self.elements.confirm().await;
        let session = self.session();

        match result {
            ConfirmResult::Succeeded { payment_id } => {
                tracing::info!("Stripe payment {} succeeded for invoice {}", payment_id, self.context.invoice_id);
                Ok(session.outcome(SettlementStatus::Paid, payment_id))
            }
            ConfirmResult::Processing { payment_id } => {
                tracing::info!("Stripe payment {} processing for invoice {}", payment_id, self.context.invoice_id);
                Ok(session.outcome(SettlementStatus::Processing, payment_id))
            }
            ConfirmResult::Failed(e) => {
                tracing::info!("Stripe confirmation failed for invoice {}: {}", self.context.invoice_id, e);
                Err(SessionError::declined(e.message))
            }
        }
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconciler.close();

        // Sessions expire server-side; only local references are released.
        let was_mounted = std::mem::replace(&mut self.state.lock().mounted, false);
        if was_mounted {
            self.elements.unmount();
        }
        tracing::debug!("Stripe session for invoice {} torn down", self.context.invoice_id);
    }
}
