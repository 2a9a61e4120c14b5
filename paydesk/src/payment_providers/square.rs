//! Square session handle (tokenizing widgets)
//!
//! Square's Web Payments SDK is a script the page has to load before anything else can happen.
//! [`ScriptLoader::ensure_loaded`] injects it once and waits a bounded time for the SDK global
//! to appear; the resulting handle is shared by every flow using the same [`SquareRuntime`].
//!
//! Each method kind gets its own tokenizer widget. Card is mandatory; wallet and bank debit are
//! only constructed when the account reports the capability, and a widget that fails to
//! construct simply drops out of the selectable set. Widgets are attached into their container
//! the first time their tab is selected. On submit the active widget produces a single-use
//! token which the backend charges.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

use crate::{
    backend::{ChargeRequest, ConnectivityStatus},
    payment_providers::{
        Availability, MethodKindCatalog, PaymentDetails, PaymentOutcome, PaymentSession, ProviderSessionHandle, Result, SessionContext,
        SessionError, SettlementStatus, SurfaceError,
    },
    types::{MethodKind, ProviderId, to_minor_units},
};

/// How long to wait for the SDK global after injecting the script
pub const DEFAULT_SCRIPT_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

const OPTIONAL_METHOD_KINDS: [MethodKind; 2] = [MethodKind::Wallet, MethodKind::BankDebit];

/// DOM container each kind's widget is attached into.
pub fn container_for(kind: MethodKind) -> &'static str {
    match kind {
        MethodKind::Card => "square-card-container",
        MethodKind::BankDebit => "square-ach-container",
        MethodKind::Wallet => "square-wallet-container",
    }
}

/// Square application the widgets are created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquareApplication {
    pub application_id: String,
    pub location_id: String,
}

/// Extra fields passed to tokenization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizeFields {
    pub account_holder_name: Option<String>,
}

/// A single method kind's secure input widget.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn attach(&self, container: &str) -> std::result::Result<(), SurfaceError>;

    /// Produce a single-use payment token.
    async fn tokenize(&self, fields: &TokenizeFields) -> std::result::Result<String, SurfaceError>;

    /// Detach and free the widget. Safe to call on a widget that was never attached.
    async fn destroy(&self);
}

/// The loaded Web Payments SDK global.
#[async_trait]
pub trait WebPaymentsSdk: Send + Sync {
    /// Construct the widget for `kind`. Wallets need the amount up front for their payment sheet.
    async fn create_tokenizer(
        &self,
        application: &SquareApplication,
        kind: MethodKind,
        amount: Decimal,
    ) -> std::result::Result<Box<dyn Tokenizer>, SurfaceError>;
}

/// Page-level script injection.
pub trait ScriptHost: Send + Sync {
    fn is_injected(&self, src: &Url) -> bool;

    fn inject(&self, src: &Url) -> std::result::Result<(), SurfaceError>;

    /// The SDK global, once the script has executed.
    fn sdk(&self) -> Option<Arc<dyn WebPaymentsSdk>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptLoadError {
    #[error("Failed to load the Square payment script: {0}")]
    Inject(SurfaceError),

    #[error("Square payment script did not load within {0:?}")]
    Timeout(Duration),
}

/// Loads the SDK script at most once.
///
/// Concurrent callers wait on the same load. A failed load is not remembered, so the next
/// flow tries again.
pub struct ScriptLoader {
    host: Arc<dyn ScriptHost>,
    script_url: Url,
    timeout: Duration,
    poll_interval: Duration,
    sdk: OnceCell<Arc<dyn WebPaymentsSdk>>,
}

impl ScriptLoader {
    pub fn new(host: Arc<dyn ScriptHost>, script_url: Url, timeout: Duration) -> Self {
        Self {
            host,
            script_url,
            timeout,
            poll_interval: Duration::from_millis(50),
            sdk: OnceCell::new(),
        }
    }

    pub async fn ensure_loaded(&self) -> std::result::Result<Arc<dyn WebPaymentsSdk>, ScriptLoadError> {
        self.sdk.get_or_try_init(|| self.load()).await.cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.sdk.initialized()
    }

    async fn load(&self) -> std::result::Result<Arc<dyn WebPaymentsSdk>, ScriptLoadError> {
        if !self.host.is_injected(&self.script_url) {
            tracing::debug!("Injecting Square script {}", self.script_url);
            self.host.inject(&self.script_url).map_err(ScriptLoadError::Inject)?;
        }

        let wait_for_global = async {
            loop {
                if let Some(sdk) = self.host.sdk() {
                    return sdk;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.timeout, wait_for_global).await {
            Ok(sdk) => {
                tracing::info!("Square script loaded from {}", self.script_url);
                Ok(sdk)
            }
            Err(_) => {
                tracing::error!("Square script {} did not load within {:?}", self.script_url, self.timeout);
                Err(ScriptLoadError::Timeout(self.timeout))
            }
        }
    }
}

/// Everything a Square session needs from the page, shared across flows.
#[derive(Clone)]
pub struct SquareRuntime {
    pub loader: Arc<ScriptLoader>,
    pub application: SquareApplication,
}

impl SquareRuntime {
    pub fn new(loader: Arc<ScriptLoader>, application: SquareApplication) -> Self {
        Self { loader, application }
    }
}

/// A constructed widget and whether it has been attached or released.
struct TokenizerSlot {
    kind: MethodKind,
    tokenizer: Box<dyn Tokenizer>,
    attached: AtomicBool,
    released: AtomicBool,
}

impl TokenizerSlot {
    fn new(kind: MethodKind, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            kind,
            tokenizer,
            attached: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Attach on first use only.
    async fn ensure_attached(&self) -> std::result::Result<(), SurfaceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SurfaceError::new("Payment form was closed"));
        }
        if self.attached.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tokenizer.attach(container_for(self.kind)).await?;
        if self.released.load(Ordering::SeqCst) {
            // Released while attaching; the earlier destroy ran before the widget landed
            self.tokenizer.destroy().await;
            return Err(SurfaceError::new("Payment form was closed"));
        }
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tokenizer.destroy().await;
    }
}

struct SquareState {
    session: PaymentSession,
    catalog: MethodKindCatalog,
    ready: bool,
}

/// Square implementation of [`ProviderSessionHandle`]
pub struct SquareSession {
    context: SessionContext,
    runtime: SquareRuntime,
    /// Optional kinds the account has the capability for
    probe_kinds: Vec<MethodKind>,
    state: Mutex<SquareState>,
    slots: Mutex<Vec<Arc<TokenizerSlot>>>,
    torn_down: AtomicBool,
}

impl SquareSession {
    pub fn new(context: SessionContext, runtime: SquareRuntime, connectivity: &ConnectivityStatus) -> Self {
        let session = PaymentSession::new(ProviderId::Square, context.invoice_total, &context.fees);

        let mut catalog = MethodKindCatalog::probing(&[MethodKind::Card]);
        let mut probe_kinds = Vec::new();
        for kind in OPTIONAL_METHOD_KINDS {
            if connectivity.square_supports(kind) {
                catalog.set(kind, Availability::Probing);
                probe_kinds.push(kind);
            } else {
                catalog.set(kind, Availability::Unavailable);
            }
        }

        Self {
            context,
            runtime,
            probe_kinds,
            state: Mutex::new(SquareState {
                session,
                catalog,
                ready: false,
            }),
            slots: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn closed_error() -> SessionError {
        SessionError::setup("Payment session was closed")
    }

    fn slot(&self, kind: MethodKind) -> Option<Arc<TokenizerSlot>> {
        self.slots.lock().iter().find(|slot| slot.kind == kind).cloned()
    }

    /// Take ownership of a freshly constructed widget, or release it at once if the session
    /// was torn down while it was being built.
    async fn register(&self, kind: MethodKind, tokenizer: Box<dyn Tokenizer>) -> Result<Arc<TokenizerSlot>> {
        let slot = Arc::new(TokenizerSlot::new(kind, tokenizer));
        let accepted = {
            let mut slots = self.slots.lock();
            if self.is_torn_down() {
                false
            } else {
                slots.push(slot.clone());
                true
            }
        };

        if !accepted {
            tracing::debug!("Releasing {} tokenizer constructed after teardown", kind);
            slot.release().await;
            return Err(Self::closed_error());
        }
        Ok(slot)
    }

    async fn construct(&self, sdk: &dyn WebPaymentsSdk, kind: MethodKind) -> std::result::Result<Box<dyn Tokenizer>, SurfaceError> {
        let amount = self.context.fees.grand_total(self.context.invoice_total, ProviderId::Square, kind);
        sdk.create_tokenizer(&self.runtime.application, kind, amount).await
    }

    fn set_availability(&self, kind: MethodKind, availability: Availability) {
        self.state.lock().catalog.set(kind, availability);
    }
}

#[async_trait]
impl ProviderSessionHandle for SquareSession {
    fn provider(&self) -> ProviderId {
        ProviderId::Square
    }

    fn session(&self) -> PaymentSession {
        self.state.lock().session.clone()
    }

    fn catalog(&self) -> MethodKindCatalog {
        self.state.lock().catalog.clone()
    }

    async fn initialize(&self) -> Result<()> {
        let sdk = self
            .runtime
            .loader
            .ensure_loaded()
            .await
            .map_err(|e| SessionError::setup(e.to_string()))?;

        if self.is_torn_down() {
            return Err(Self::closed_error());
        }

        let card = self.construct(sdk.as_ref(), MethodKind::Card).await.map_err(|e| {
            tracing::error!("Failed to construct Square card tokenizer for invoice {}: {}", self.context.invoice_id, e);
            SessionError::setup(e.to_string())
        })?;
        let card = self.register(MethodKind::Card, card).await?;

        for kind in self.probe_kinds.clone() {
            match self.construct(sdk.as_ref(), kind).await {
                Ok(tokenizer) => {
                    self.register(kind, tokenizer).await?;
                    self.set_availability(kind, Availability::Available);
                }
                Err(e) => {
                    tracing::info!("Square {} unavailable on this device: {}", kind, e);
                    self.set_availability(kind, Availability::Unavailable);
                }
            }
        }

        card.ensure_attached().await.map_err(|e| {
            tracing::error!("Failed to attach Square card tokenizer: {}", e);
            SessionError::setup(e.to_string())
        })?;

        let mut state = self.state.lock();
        if self.is_torn_down() {
            return Err(Self::closed_error());
        }
        state.catalog.set(MethodKind::Card, Availability::Available);
        state.ready = true;

        tracing::info!("Square session ready for invoice {}", self.context.invoice_id);
        Ok(())
    }

    async fn on_method_kind_change(&self, kind: MethodKind) -> Result<()> {
        {
            let state = self.state.lock();
            if !state.ready {
                return Err(SessionError::NotReady);
            }
            if state.session.method_kind == kind {
                return Ok(());
            }
            if !state.catalog.is_selectable(kind) {
                return Err(SessionError::MethodUnavailable(kind));
            }
        }

        let slot = self.slot(kind).ok_or(SessionError::MethodUnavailable(kind))?;
        if let Err(e) = slot.ensure_attached().await {
            tracing::warn!("Failed to attach Square {} tokenizer: {}", kind, e);
            self.set_availability(kind, Availability::Unavailable);
            return Err(SessionError::MethodUnavailable(kind));
        }

        self.state.lock().session.reprice(kind, &self.context.fees);
        Ok(())
    }

    async fn submit(&self, details: &PaymentDetails) -> Result<PaymentOutcome> {
        let session = {
            let state = self.state.lock();
            if !state.ready || self.is_torn_down() {
                return Err(SessionError::NotReady);
            }
            state.session.clone()
        };
        let kind = session.method_kind;

        let fields = match kind {
            MethodKind::BankDebit => {
                let name = details
                    .account_holder_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| SessionError::validation("Account holder name is required for bank payments"))?;
                TokenizeFields {
                    account_holder_name: Some(name.to_string()),
                }
            }
            MethodKind::Card | MethodKind::Wallet => TokenizeFields::default(),
        };

        let amount = to_minor_units(session.grand_total).ok_or_else(|| SessionError::validation("Amount is out of range"))?;
        let slot = self.slot(kind).ok_or(SessionError::NotReady)?;

        let token = slot.tokenizer.tokenize(&fields).await.map_err(|e| {
            tracing::info!("Square tokenization failed for invoice {}: {}", self.context.invoice_id, e);
            SessionError::declined(e.message)
        })?;

        let request = ChargeRequest {
            amount,
            token: token.clone(),
            invoice_id: self.context.invoice_id,
            customer_contact: self.context.customer_contact.clone(),
        };
        let response = self.context.backend.charge_by_token(&request).await.map_err(|e| {
            tracing::warn!("Square charge request failed for invoice {}: {}", self.context.invoice_id, e);
            SessionError::declined(e.user_message())
        })?;

        if !response.success {
            tracing::info!("Square charge declined for invoice {}", self.context.invoice_id);
            return Err(SessionError::declined(response.message));
        }

        let charge_id = response.charge_id.unwrap_or_else(|| {
            tracing::warn!("Square charge response had no charge id, correlating by token");
            token
        });
        let status = if kind.settles_asynchronously() || response.status.as_deref() == Some("PENDING") {
            SettlementStatus::Processing
        } else {
            SettlementStatus::Paid
        };

        tracing::info!("Square charge {} {:?} for invoice {}", charge_id, status, self.context.invoice_id);
        Ok(session.outcome(status, charge_id))
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().ready = false;

        let slots = std::mem::take(&mut *self.slots.lock());
        for slot in &slots {
            slot.release().await;
        }
        tracing::debug!("Square session torn down, released {} tokenizers", slots.len());
    }
}
