//! Payment flow state machine.
//!
//! A [`PaymentFlow`] drives one operator's attempt to pay one invoice:
//!
//! ```text
//! ProviderSelection ──choose──▶ SessionInitializing ──▶ Ready ──submit──▶ Submitting ──▶ Success
//!        ▲                              │                 ▲                   │
//!        └────────────back──────────────┴──▶ SetupError    └──inline error─────┘
//! ```
//!
//! `close` is accepted from any state and ends in `Closed`. At most one provider session handle
//! is live at a time; leaving a session for any reason tears it down before anything else
//! happens. Every close or back bumps the flow epoch, and results of async work started under
//! an older epoch are discarded on arrival, so a closed flow never writes to the invoice.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::instrument;

use crate::{
    backend::{ConnectivityStatus, PaymentBackend},
    fees::FeeSchedule,
    invoice::{Invoice, InvoiceStatusUpdate, InvoiceStatusUpdater},
    payment_providers::{
        MethodKindCatalog, PaymentDetails, PaymentOutcome, PaymentSession, ProviderSessionHandle, ProviderSurfaces, SessionContext,
        SessionError,
    },
    selector::{ProviderPreview, ProviderSelection},
    types::{FlowId, MethodKind, ProviderId, abbrev_uuid},
};

/// Invoked once when a payment succeeds.
pub type CompletionCallback = Box<dyn FnOnce(&PaymentOutcome) + Send>;

/// Whether the invoicing service accepted the status write after a successful charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InvoiceSync {
    /// The status write is still in flight
    Pending,
    Updated,
    /// The money moved but the invoice still shows its old status
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    Closed {
        cancelled: bool,
    },
    ProviderSelection {
        previews: Vec<ProviderPreview>,
    },
    SessionInitializing {
        provider: ProviderId,
    },
    Ready {
        provider: ProviderId,
        /// Last declined or invalid submission
        inline_error: Option<String>,
    },
    Submitting {
        provider: ProviderId,
    },
    /// Only back (when allowed) and close are possible
    SetupError {
        provider: Option<ProviderId>,
        message: String,
        can_go_back: bool,
    },
    Success {
        outcome: PaymentOutcome,
        invoice_sync: InvoiceSync,
    },
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Closed { .. } => "closed",
            FlowState::ProviderSelection { .. } => "provider_selection",
            FlowState::SessionInitializing { .. } => "session_initializing",
            FlowState::Ready { .. } => "ready",
            FlowState::Submitting { .. } => "submitting",
            FlowState::SetupError { .. } => "setup_error",
            FlowState::Success { .. } => "success",
        }
    }
}

/// What became of a submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Completed(PaymentOutcome),
    /// Declined or invalid; the flow is back in `Ready` with an inline error
    Rejected(SessionError),
    /// Another submission is already in flight
    Ignored,
    /// The flow was closed or left while the submission was in flight
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("Cannot {action} while the payment flow is {state}")]
    InvalidTransition { action: &'static str, state: &'static str },

    #[error("{0} is not available for this invoice")]
    ProviderUnavailable(ProviderId),

    #[error("The payment flow was closed or changed before the operation finished")]
    Interrupted,

    #[error(transparent)]
    Session(#[from] SessionError),
}

struct FlowInner {
    state: FlowState,
    handle: Option<Arc<dyn ProviderSessionHandle>>,
}

/// Collaborators a flow is wired with.
pub(crate) struct FlowParts {
    pub invoice: Invoice,
    pub selection: ProviderSelection,
    pub connectivity: ConnectivityStatus,
    pub fees: Arc<FeeSchedule>,
    pub backend: Arc<dyn PaymentBackend>,
    pub invoices: Arc<dyn InvoiceStatusUpdater>,
    pub surfaces: ProviderSurfaces,
    pub on_complete: CompletionCallback,
}

pub struct PaymentFlow {
    id: FlowId,
    invoice: Invoice,
    selection: ProviderSelection,
    connectivity: ConnectivityStatus,
    fees: Arc<FeeSchedule>,
    backend: Arc<dyn PaymentBackend>,
    invoices: Arc<dyn InvoiceStatusUpdater>,
    surfaces: ProviderSurfaces,
    inner: Mutex<FlowInner>,
    epoch: AtomicU64,
    submitting: AtomicBool,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl PaymentFlow {
    pub(crate) fn new(parts: FlowParts) -> Self {
        let previews = parts.selection.previews(parts.invoice.total, &parts.fees);
        Self {
            id: FlowId::new_v4(),
            invoice: parts.invoice,
            selection: parts.selection,
            connectivity: parts.connectivity,
            fees: parts.fees,
            backend: parts.backend,
            invoices: parts.invoices,
            surfaces: parts.surfaces,
            inner: Mutex::new(FlowInner {
                state: FlowState::ProviderSelection { previews },
                handle: None,
            }),
            epoch: AtomicU64::new(0),
            submitting: AtomicBool::new(false),
            on_complete: Mutex::new(Some(parts.on_complete)),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn invoice(&self) -> &Invoice {
        &self.invoice
    }

    pub fn selection(&self) -> ProviderSelection {
        self.selection
    }

    pub fn state(&self) -> FlowState {
        self.inner.lock().state.clone()
    }

    /// Pricing of the live session, if any.
    pub fn session(&self) -> Option<PaymentSession> {
        self.inner.lock().handle.as_ref().map(|handle| handle.session())
    }

    pub fn catalog(&self) -> Option<MethodKindCatalog> {
        self.inner.lock().handle.as_ref().map(|handle| handle.catalog())
    }

    fn invalid(action: &'static str, state: &FlowState) -> FlowError {
        FlowError::InvalidTransition {
            action,
            state: state.name(),
        }
    }

    /// Start a session with `provider` and wait for it to become ready.
    #[instrument(skip(self), fields(flow_id = %abbrev_uuid(&self.id), invoice_id = %abbrev_uuid(&self.invoice.id)))]
    pub async fn choose_provider(&self, provider: ProviderId) -> Result<(), FlowError> {
        if !self.selection.is_selectable(provider) {
            return Err(FlowError::ProviderUnavailable(provider));
        }

        let context = SessionContext::new(&self.invoice, self.fees.clone(), self.backend.clone());
        let created = self.surfaces.create_session(provider, context, &self.connectivity);
        let (previous, epoch) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, FlowState::ProviderSelection { .. }) {
                return Err(Self::invalid("choose a provider", &inner.state));
            }
            inner.state = match &created {
                Ok(_) => FlowState::SessionInitializing { provider },
                Err(e) => self.setup_error(Some(provider), e),
            };
            let previous = std::mem::replace(&mut inner.handle, created.as_ref().ok().cloned());
            (previous, self.epoch.load(Ordering::SeqCst))
        };

        if let Some(previous) = previous {
            previous.teardown().await;
        }
        let handle = created?;

        tracing::info!(provider = %provider, "Initializing payment session");
        let result = handle.initialize().await;

        let failed_handle = {
            let mut inner = self.inner.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // Whoever bumped the epoch already tore the handle down
                tracing::debug!(provider = %provider, "Discarding session initialization for a stale flow");
                return Err(FlowError::Interrupted);
            }

            match &result {
                Ok(()) => {
                    inner.state = FlowState::Ready {
                        provider,
                        inline_error: None,
                    };
                    None
                }
                Err(e) => {
                    tracing::error!(provider = %provider, error = %e, "Payment session failed to initialize");
                    inner.state = self.setup_error(Some(provider), e);
                    inner.handle.take()
                }
            }
        };

        if let Some(handle) = failed_handle {
            handle.teardown().await;
        }
        result?;
        tracing::info!(provider = %provider, "Payment session ready");
        Ok(())
    }

    fn setup_error(&self, provider: Option<ProviderId>, error: &SessionError) -> FlowState {
        FlowState::SetupError {
            provider,
            message: error.to_string(),
            can_go_back: self.selection.allows_back(),
        }
    }

    /// Switch the method kind on the live session.
    pub async fn select_method_kind(&self, kind: MethodKind) -> Result<(), FlowError> {
        let handle = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.handle) {
                (FlowState::Ready { .. }, Some(handle)) => handle.clone(),
                (state, _) => return Err(Self::invalid("change payment method", state)),
            }
        };

        handle.on_method_kind_change(kind).await?;
        tracing::debug!(flow_id = %abbrev_uuid(&self.id), kind = %kind, "Payment method changed");
        Ok(())
    }

    /// Submit the payment.
    ///
    /// Only one submission runs at a time; a call made while another is in flight returns
    /// [`SubmitResult::Ignored`] without touching the processor. On success the invoice status is
    /// written exactly once and the completion callback fires exactly once.
    #[instrument(skip(self, details), fields(flow_id = %abbrev_uuid(&self.id), invoice_id = %abbrev_uuid(&self.invoice.id)))]
    pub async fn submit(&self, details: &PaymentDetails) -> Result<SubmitResult, FlowError> {
        if self.submitting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Submission already in flight, ignoring");
            return Ok(SubmitResult::Ignored);
        }
        let _guard = scopeguard::guard((), |_| {
            self.submitting.store(false, Ordering::SeqCst);
        });

        let (handle, provider, epoch) = {
            let mut inner = self.inner.lock();
            let (provider, handle) = match (&inner.state, &inner.handle) {
                (FlowState::Ready { provider, .. }, Some(handle)) => (*provider, handle.clone()),
                (state, _) => return Err(Self::invalid("submit", state)),
            };
            inner.state = FlowState::Submitting { provider };
            (handle, provider, self.epoch.load(Ordering::SeqCst))
        };

        let result = handle.submit(details).await;

        let (released, outcome) = {
            let mut inner = self.inner.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                if let Ok(outcome) = &result {
                    tracing::warn!(
                        transaction_id = %outcome.transaction_id,
                        "Payment completed after the flow was closed, invoice left untouched"
                    );
                }
                return Ok(SubmitResult::Discarded);
            }

            match result {
                Ok(outcome) => {
                    // Entered before the invoice write; a close from here on is not a cancellation
                    inner.state = FlowState::Success {
                        outcome: outcome.clone(),
                        invoice_sync: InvoiceSync::Pending,
                    };
                    (inner.handle.take(), Ok(outcome))
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(provider = %provider, error = %e, "Payment session failed during submission");
                    inner.state = self.setup_error(Some(provider), &e);
                    (inner.handle.take(), Err(e))
                }
                Err(e) => {
                    tracing::info!(provider = %provider, error = %e, "Payment submission rejected");
                    inner.state = FlowState::Ready {
                        provider,
                        inline_error: Some(e.to_string()),
                    };
                    (None, Err(e))
                }
            }
        };

        if let Some(handle) = released {
            handle.teardown().await;
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Ok(SubmitResult::Rejected(e)),
        };

        let sync = self.record_outcome(&outcome).await;
        if let FlowState::Success { invoice_sync, .. } = &mut self.inner.lock().state {
            *invoice_sync = sync;
        }

        tracing::info!(
            provider = %provider,
            transaction_id = %outcome.transaction_id,
            status = ?outcome.status,
            amount = %outcome.amount,
            "Payment succeeded"
        );

        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(&outcome);
        }

        Ok(SubmitResult::Completed(outcome))
    }

    async fn record_outcome(&self, outcome: &PaymentOutcome) -> InvoiceSync {
        let result = match InvoiceStatusUpdate::for_outcome(&self.invoice, outcome, Utc::now()) {
            Ok(update) => self.invoices.update_status(&update).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => InvoiceSync::Updated,
            Err(e) => {
                tracing::error!(
                    invoice_id = %self.invoice.id,
                    transaction_id = %outcome.transaction_id,
                    error = %e,
                    "Payment succeeded but the invoice status could not be updated"
                );
                InvoiceSync::Failed { message: e.to_string() }
            }
        }
    }

    /// Leave the current session and return to provider selection.
    pub async fn back(&self) -> Result<(), FlowError> {
        let handle = {
            let mut inner = self.inner.lock();
            let leavable = matches!(
                inner.state,
                FlowState::SessionInitializing { .. } | FlowState::Ready { .. } | FlowState::SetupError { .. }
            );
            if !leavable || !self.selection.allows_back() {
                return Err(Self::invalid("go back", &inner.state));
            }

            self.epoch.fetch_add(1, Ordering::SeqCst);
            inner.state = FlowState::ProviderSelection {
                previews: self.selection.previews(self.invoice.total, &self.fees),
            };
            inner.handle.take()
        };

        if let Some(handle) = handle {
            handle.teardown().await;
        }
        tracing::info!(flow_id = %abbrev_uuid(&self.id), "Returned to provider selection");
        Ok(())
    }

    /// Close the flow from any state. Closing twice is a no-op.
    pub async fn close(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, FlowState::Closed { .. }) {
                return;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let cancelled = !matches!(inner.state, FlowState::Success { .. });
            inner.state = FlowState::Closed { cancelled };
            inner.handle.take()
        };

        if let Some(handle) = handle {
            handle.teardown().await;
        }
        tracing::info!(flow_id = %abbrev_uuid(&self.id), "Payment flow closed");
    }
}
