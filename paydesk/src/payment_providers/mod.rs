//! Payment provider session abstraction layer
//!
//! This module defines the `ProviderSessionHandle` trait, which owns the lifecycle of a single
//! processor's secure input surface for one payment attempt:
//!
//! 1. `initialize` - create the remote session / load the provider script and mount the UI
//! 2. `on_method_kind_change` - re-price the session when the operator switches instrument
//! 3. `submit` - tokenize or confirm, producing a [`PaymentOutcome`]
//! 4. `teardown` - release every resource the handle acquired
//!
//! Two implementations exist: [`stripe::StripeSession`] (hosted elements bound to a remote
//! session) and [`square::SquareSession`] (per-method tokenizer widgets). Every remote failure
//! is converted into a [`SessionError`] at this boundary; callers never see transport errors.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    backend::{ConnectivityStatus, PaymentBackend},
    fees::FeeSchedule,
    invoice::Invoice,
    types::{InvoiceId, MethodKind, ProviderId},
};

pub mod square;
pub mod stripe;

/// Shown when the processor gives no reason of its own.
pub const GENERIC_PAYMENT_ERROR: &str = "The payment could not be completed. Please try again.";

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by a provider session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session or provider script could not be initialized. Only back/cancel are possible.
    #[error("{message}")]
    Setup { message: String },

    /// Local input problem; no remote call was made.
    #[error("{message}")]
    Validation { message: String },

    /// The processor rejected tokenization or confirmation. The operator may resubmit.
    #[error("{message}")]
    Declined { message: String },

    #[error("The payment form is not ready yet")]
    NotReady,

    #[error("Payment method {0} is not available")]
    MethodUnavailable(MethodKind),
}

impl SessionError {
    pub fn setup(message: impl Into<String>) -> Self {
        SessionError::Setup { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation { message: message.into() }
    }

    /// Use the processor's message when it has one.
    pub fn declined(message: Option<String>) -> Self {
        SessionError::Declined {
            message: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_PAYMENT_ERROR.to_string()),
        }
    }

    /// Fatal errors end the flow instance; everything else is shown inline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Setup { .. })
    }
}

/// Failure reported by a browser-side surface (hosted element, script, tokenizer).
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", .message.as_deref().unwrap_or(GENERIC_PAYMENT_ERROR))]
pub struct SurfaceError {
    pub message: Option<String>,
}

impl SurfaceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Invoice status a successful payment settles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Paid,
    /// Accepted, but funds settle later (bank debits)
    Processing,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    pub provider: ProviderId,
    pub status: SettlementStatus,
    /// Provider transaction identifier (payment intent or charge id)
    pub transaction_id: String,
    pub method_kind: MethodKind,
    /// Amount charged, fee included
    pub amount: Decimal,
    pub fee: Decimal,
}

/// Operator-entered fields that are not captured by the provider's secure inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentDetails {
    /// Required for bank debits
    pub account_holder_name: Option<String>,
}

/// Priced state of a payment attempt.
///
/// `grand_total` is always `invoice_total + fee` for the current `method_kind`; use
/// [`PaymentSession::reprice`] to change kind so the two never drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSession {
    pub provider: ProviderId,
    pub session_id: Option<String>,
    #[serde(skip_serializing)]
    pub session_secret: Option<String>,
    pub method_kind: MethodKind,
    pub invoice_total: Decimal,
    pub fee: Decimal,
    pub grand_total: Decimal,
}

impl PaymentSession {
    pub fn new(provider: ProviderId, invoice_total: Decimal, fees: &FeeSchedule) -> Self {
        let mut session = Self {
            provider,
            session_id: None,
            session_secret: None,
            method_kind: MethodKind::DEFAULT,
            invoice_total,
            fee: Decimal::ZERO,
            grand_total: invoice_total,
        };
        session.reprice(MethodKind::DEFAULT, fees);
        session
    }

    pub fn reprice(&mut self, kind: MethodKind, fees: &FeeSchedule) {
        self.method_kind = kind;
        self.fee = fees.compute_fee(self.invoice_total, self.provider, kind);
        self.grand_total = fees.grand_total(self.invoice_total, self.provider, kind);
    }

    pub fn outcome(&self, status: SettlementStatus, transaction_id: String) -> PaymentOutcome {
        PaymentOutcome {
            provider: self.provider,
            status,
            transaction_id,
            method_kind: self.method_kind,
            amount: self.grand_total,
            fee: self.fee,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Capability probe has not resolved yet
    Probing,
    Available,
    Unavailable,
}

/// Method kinds a provider offers, and whether each can currently be selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodKindCatalog {
    entries: Vec<(MethodKind, Availability)>,
}

impl MethodKindCatalog {
    pub fn probing(kinds: &[MethodKind]) -> Self {
        Self {
            entries: kinds.iter().map(|kind| (*kind, Availability::Probing)).collect(),
        }
    }

    pub fn available(kinds: &[MethodKind]) -> Self {
        Self {
            entries: kinds.iter().map(|kind| (*kind, Availability::Available)).collect(),
        }
    }

    pub fn set(&mut self, kind: MethodKind, availability: Availability) {
        match self.entries.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = availability,
            None => self.entries.push((kind, availability)),
        }
    }

    pub fn availability(&self, kind: MethodKind) -> Option<Availability> {
        self.entries.iter().find(|(k, _)| *k == kind).map(|(_, a)| *a)
    }

    pub fn is_selectable(&self, kind: MethodKind) -> bool {
        self.availability(kind) == Some(Availability::Available)
    }

    pub fn selectable(&self) -> Vec<MethodKind> {
        self.entries
            .iter()
            .filter(|(_, a)| *a == Availability::Available)
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Progress of re-pricing the remote session after a method-kind change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconciliationState {
    /// Remote amount matches the session as created
    InSync,
    InFlight { kind: MethodKind, amount: Decimal },
    Applied { kind: MethodKind, amount: Decimal },
    Failed { kind: MethodKind },
}

/// Latest-wins bookkeeping for fire-and-forget reconciliation calls.
///
/// Each call takes a generation number from [`Reconciler::begin`]; only the result carrying the
/// newest generation may update the state. Results arriving after [`Reconciler::close`] are
/// dropped.
#[derive(Debug)]
pub struct Reconciler {
    generation: AtomicU64,
    closed: AtomicBool,
    state: Mutex<ReconciliationState>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state: Mutex::new(ReconciliationState::InSync),
        }
    }
}

impl Reconciler {
    pub fn begin(&self, kind: MethodKind, amount: Decimal) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock() = ReconciliationState::InFlight { kind, amount };
        generation
    }

    /// Record the result of call `generation`. Returns whether it was applied.
    pub fn finish(&self, generation: u64, kind: MethodKind, amount: Decimal, succeeded: bool) -> bool {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding stale reconciliation result for {} (generation {})", kind, generation);
            return false;
        }
        *state = if succeeded {
            ReconciliationState::Applied { kind, amount }
        } else {
            ReconciliationState::Failed { kind }
        };
        true
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> ReconciliationState {
        self.state.lock().clone()
    }
}

/// Invoice facts and collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub invoice_id: InvoiceId,
    pub invoice_total: Decimal,
    pub customer_contact: String,
    pub fees: Arc<FeeSchedule>,
    pub backend: Arc<dyn PaymentBackend>,
}

impl SessionContext {
    pub fn new(invoice: &Invoice, fees: Arc<FeeSchedule>, backend: Arc<dyn PaymentBackend>) -> Self {
        Self {
            invoice_id: invoice.id,
            invoice_total: invoice.total,
            customer_contact: invoice.customer_contact.clone(),
            fees,
            backend,
        }
    }
}

/// Lifecycle of one provider's secure payment surface.
///
/// Implementations must make `teardown` idempotent and safe to call at any point, including
/// while `initialize` is still running on another task.
#[async_trait]
pub trait ProviderSessionHandle: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Current pricing snapshot.
    fn session(&self) -> PaymentSession;

    /// Selectable method kinds.
    fn catalog(&self) -> MethodKindCatalog;

    /// Create the remote session / load scripts and mount the input surface.
    async fn initialize(&self) -> Result<()>;

    /// Switch the active method kind and re-price.
    async fn on_method_kind_change(&self, kind: MethodKind) -> Result<()>;

    /// Tokenize or confirm. Errors other than `Setup` leave the session ready for resubmission.
    async fn submit(&self, details: &PaymentDetails) -> Result<PaymentOutcome>;

    /// Release every resource the handle acquired.
    async fn teardown(&self);
}

/// Browser surfaces the embedding UI provides, per provider.
#[derive(Clone, Default)]
pub struct ProviderSurfaces {
    pub stripe: Option<Arc<dyn stripe::HostedElementsFactory>>,
    pub square: Option<square::SquareRuntime>,
}

impl ProviderSurfaces {
    pub fn supports(&self, provider: ProviderId) -> bool {
        match provider {
            ProviderId::Stripe => self.stripe.is_some(),
            ProviderId::Square => self.square.is_some(),
        }
    }

    /// Create a session handle for `provider`
    ///
    /// This is the single point where providers are turned into handles.
    pub fn create_session(
        &self,
        provider: ProviderId,
        context: SessionContext,
        connectivity: &ConnectivityStatus,
    ) -> Result<Arc<dyn ProviderSessionHandle>> {
        match provider {
            ProviderId::Stripe => {
                let factory = self.stripe.as_ref().ok_or_else(|| SessionError::setup("Stripe is not configured"))?;
                Ok(Arc::new(stripe::StripeSession::new(context, factory.create())))
            }
            ProviderId::Square => {
                let runtime = self.square.as_ref().ok_or_else(|| SessionError::setup("Square is not configured"))?;
                Ok(Arc::new(square::SquareSession::new(context, runtime.clone(), connectivity)))
            }
        }
    }
}
