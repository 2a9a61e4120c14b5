//! Test doubles for the backend, the invoicing service and the browser surfaces.
//!
//! Every mock records the calls made to it so tests can assert on exactly what was sent.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::{
    backend::{
        BackendError, ChargeRequest, ChargeResponse, ConnectivityStatus, CreateSessionRequest, CreateSessionResponse, PaymentBackend,
        Result as BackendResult, UpdateSessionAmountRequest, UpdateSessionAmountResponse,
    },
    fees::FeeSchedule,
    invoice::{Invoice, InvoiceError, InvoiceStatus, InvoiceStatusUpdate, InvoiceStatusUpdater},
    payment_providers::{
        SessionContext, SurfaceError,
        square::{
            DEFAULT_SCRIPT_LOAD_TIMEOUT, ScriptHost, ScriptLoader, SquareApplication, SquareRuntime, TokenizeFields, Tokenizer,
            WebPaymentsSdk,
        },
        stripe::{ConfirmResult, HostedElements, HostedElementsFactory},
    },
    types::MethodKind,
};

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn sample_invoice(total: &str, status: InvoiceStatus) -> Invoice {
    Invoice {
        id: Uuid::new_v4(),
        total: dec(total),
        status,
        customer_contact: "billing@example.com".to_string(),
        correlation: None,
    }
}

pub fn session_context(backend: Arc<MockBackend>, total: &str) -> SessionContext {
    SessionContext::new(
        &sample_invoice(total, InvoiceStatus::Pending),
        Arc::new(FeeSchedule::default()),
        backend,
    )
}

pub fn square_runtime(host: Arc<MockScriptHost>) -> SquareRuntime {
    let loader = ScriptLoader::new(
        host,
        Url::parse("https://sandbox.web.squarecdn.com/v1/square.js").unwrap(),
        DEFAULT_SCRIPT_LOAD_TIMEOUT,
    );
    SquareRuntime::new(
        Arc::new(loader),
        SquareApplication {
            application_id: "sandbox-sq0idb-test".to_string(),
            location_id: "L1234".to_string(),
        },
    )
}

pub fn charge_ok(charge_id: &str) -> ChargeResponse {
    ChargeResponse {
        success: true,
        charge_id: Some(charge_id.to_string()),
        status: Some("COMPLETED".to_string()),
        message: None,
    }
}

fn status_error(message: &str) -> BackendError {
    BackendError::Status {
        status: 400,
        body: serde_json::json!({ "message": message }).to_string(),
    }
}

/// Call-recording `PaymentBackend`.
///
/// Sessions are numbered `session_1`, `session_2`, ... Charges answer from a FIFO queue and
/// fall back to a successful charge when the queue is empty.
pub struct MockBackend {
    connectivity: Mutex<ConnectivityAnswer<ConnectivityStatus>>,
    create_session_calls: Mutex<Vec<CreateSessionRequest>>,
    create_session_error: Mutex<Option<String>>,
    update_amount_calls: Mutex<Vec<UpdateSessionAmountRequest>>,
    update_amount_delays: Mutex<VecDeque<Duration>>,
    update_amount_fails: AtomicBool,
    charge_calls: Mutex<Vec<ChargeRequest>>,
    charge_responses: Mutex<VecDeque<BackendResult<ChargeResponse>>>,
    charge_delay: Mutex<Option<Duration>>,
}

enum ConnectivityAnswer<T> {
    Value(T),
    Unreachable,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_connectivity(ConnectivityStatus {
            stripe_connected: true,
            square_connected: true,
            square_capabilities: Vec::new(),
        })
    }

    pub fn with_connectivity(status: ConnectivityStatus) -> Self {
        Self {
            connectivity: Mutex::new(ConnectivityAnswer::Value(status)),
            create_session_calls: Mutex::new(Vec::new()),
            create_session_error: Mutex::new(None),
            update_amount_calls: Mutex::new(Vec::new()),
            update_amount_delays: Mutex::new(VecDeque::new()),
            update_amount_fails: AtomicBool::new(false),
            charge_calls: Mutex::new(Vec::new()),
            charge_responses: Mutex::new(VecDeque::new()),
            charge_delay: Mutex::new(None),
        }
    }

    pub fn connectivity_unreachable(&self) {
        *self.connectivity.lock() = ConnectivityAnswer::Unreachable;
    }

    pub fn fail_create_session(&self, message: &str) {
        *self.create_session_error.lock() = Some(message.to_string());
    }

    /// Delay for the next update-amount call; queued per call.
    pub fn delay_update_amount(&self, delay: Duration) {
        self.update_amount_delays.lock().push_back(delay);
    }

    pub fn fail_update_amount(&self) {
        self.update_amount_fails.store(true, Ordering::SeqCst);
    }

    pub fn push_charge(&self, response: BackendResult<ChargeResponse>) {
        self.charge_responses.lock().push_back(response);
    }

    pub fn delay_charge(&self, delay: Duration) {
        *self.charge_delay.lock() = Some(delay);
    }

    pub fn create_session_calls(&self) -> Vec<CreateSessionRequest> {
        self.create_session_calls.lock().clone()
    }

    pub fn update_amount_calls(&self) -> Vec<UpdateSessionAmountRequest> {
        self.update_amount_calls.lock().clone()
    }

    pub fn charge_calls(&self) -> Vec<ChargeRequest> {
        self.charge_calls.lock().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentBackend for MockBackend {
    async fn create_session(&self, request: &CreateSessionRequest) -> BackendResult<CreateSessionResponse> {
        let n = {
            let mut calls = self.create_session_calls.lock();
            calls.push(request.clone());
            calls.len()
        };
        if let Some(message) = self.create_session_error.lock().clone() {
            return Err(status_error(&message));
        }
        Ok(CreateSessionResponse {
            session_secret: format!("secret_{n}"),
            session_id: format!("session_{n}"),
        })
    }

    async fn update_session_amount(&self, request: &UpdateSessionAmountRequest) -> BackendResult<UpdateSessionAmountResponse> {
        self.update_amount_calls.lock().push(request.clone());
        let delay = self.update_amount_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.update_amount_fails.load(Ordering::SeqCst) {
            return Err(status_error("session is no longer updatable"));
        }
        Ok(UpdateSessionAmountResponse { success: true })
    }

    async fn charge_by_token(&self, request: &ChargeRequest) -> BackendResult<ChargeResponse> {
        self.charge_calls.lock().push(request.clone());
        let delay = *self.charge_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.charge_responses.lock().pop_front();
        response.unwrap_or_else(|| Ok(charge_ok(&format!("sq_charge_{}", self.charge_calls.lock().len()))))
    }

    async fn connectivity_status(&self) -> BackendResult<ConnectivityStatus> {
        match &*self.connectivity.lock() {
            ConnectivityAnswer::Value(status) => Ok(status.clone()),
            ConnectivityAnswer::Unreachable => Err(BackendError::Status {
                status: 503,
                body: String::new(),
            }),
        }
    }
}

/// Call-recording `InvoiceStatusUpdater`.
#[derive(Default)]
pub struct MockInvoiceApi {
    updates: Mutex<Vec<InvoiceStatusUpdate>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockInvoiceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn delay_updates(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn updates(&self) -> Vec<InvoiceStatusUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl InvoiceStatusUpdater for MockInvoiceApi {
    async fn update_status(&self, update: &InvoiceStatusUpdate) -> Result<(), InvoiceError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.updates.lock().push(update.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(InvoiceError::Rejected);
        }
        Ok(())
    }
}

#[derive(Default)]
struct HostedElementsInner {
    mounted: Mutex<Vec<String>>,
    mount_delay: Mutex<Option<Duration>>,
    mount_error: Mutex<Option<String>>,
    confirms: Mutex<VecDeque<ConfirmResult>>,
    confirm_delay: Mutex<Option<Duration>>,
    confirm_count: AtomicUsize,
    unmount_count: AtomicUsize,
}

/// Shared-state hosted element; clones observe the same element.
#[derive(Clone, Default)]
pub struct MockHostedElements {
    inner: Arc<HostedElementsInner>,
}

impl MockHostedElements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay_mount(&self, delay: Duration) {
        *self.inner.mount_delay.lock() = Some(delay);
    }

    pub fn fail_mount(&self, message: &str) {
        *self.inner.mount_error.lock() = Some(message.to_string());
    }

    pub fn push_confirm(&self, result: ConfirmResult) {
        self.inner.confirms.lock().push_back(result);
    }

    pub fn delay_confirm(&self, delay: Duration) {
        *self.inner.confirm_delay.lock() = Some(delay);
    }

    pub fn mounted_secrets(&self) -> Vec<String> {
        self.inner.mounted.lock().clone()
    }

    pub fn confirm_count(&self) -> usize {
        self.inner.confirm_count.load(Ordering::SeqCst)
    }

    pub fn unmount_count(&self) -> usize {
        self.inner.unmount_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostedElements for MockHostedElements {
    async fn mount(&self, client_secret: &str) -> Result<(), SurfaceError> {
        let delay = *self.inner.mount_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.inner.mount_error.lock().clone() {
            return Err(SurfaceError::new(message));
        }
        self.inner.mounted.lock().push(client_secret.to_string());
        Ok(())
    }

    async fn confirm(&self) -> ConfirmResult {
        let n = self.inner.confirm_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.inner.confirm_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.inner.confirms.lock().pop_front();
        result.unwrap_or_else(|| ConfirmResult::Succeeded {
            payment_id: format!("pi_{n}"),
        })
    }

    fn unmount(&self) {
        self.inner.unmount_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out clones of one `MockHostedElements`, counting how many were created.
#[derive(Default)]
pub struct MockHostedElementsFactory {
    pub elements: MockHostedElements,
    created: AtomicUsize,
}

impl MockHostedElementsFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl HostedElementsFactory for MockHostedElementsFactory {
    fn create(&self) -> Box<dyn HostedElements> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(self.elements.clone())
    }
}

/// Page stand-in: the SDK global appears as soon as the script is injected, or never.
pub struct MockScriptHost {
    injected: AtomicBool,
    inject_calls: AtomicUsize,
    pending_sdk: Mutex<Option<Arc<dyn WebPaymentsSdk>>>,
    sdk: Mutex<Option<Arc<dyn WebPaymentsSdk>>>,
}

impl MockScriptHost {
    pub fn loading(sdk: Arc<MockSdk>) -> Self {
        let sdk: Arc<dyn WebPaymentsSdk> = sdk;
        Self {
            injected: AtomicBool::new(false),
            inject_calls: AtomicUsize::new(0),
            pending_sdk: Mutex::new(Some(sdk)),
            sdk: Mutex::new(None),
        }
    }

    pub fn never_loads() -> Self {
        Self {
            injected: AtomicBool::new(false),
            inject_calls: AtomicUsize::new(0),
            pending_sdk: Mutex::new(None),
            sdk: Mutex::new(None),
        }
    }

    /// Make the SDK global appear, as if a slow script finally executed.
    pub fn expose(&self, sdk: Arc<MockSdk>) {
        let sdk: Arc<dyn WebPaymentsSdk> = sdk;
        *self.sdk.lock() = Some(sdk);
    }

    pub fn inject_calls(&self) -> usize {
        self.inject_calls.load(Ordering::SeqCst)
    }
}

impl ScriptHost for MockScriptHost {
    fn is_injected(&self, _src: &Url) -> bool {
        self.injected.load(Ordering::SeqCst)
    }

    fn inject(&self, _src: &Url) -> Result<(), SurfaceError> {
        self.inject_calls.fetch_add(1, Ordering::SeqCst);
        self.injected.store(true, Ordering::SeqCst);
        if let Some(sdk) = self.pending_sdk.lock().take() {
            *self.sdk.lock() = Some(sdk);
        }
        Ok(())
    }

    fn sdk(&self) -> Option<Arc<dyn WebPaymentsSdk>> {
        self.sdk.lock().clone()
    }
}

/// Observations of every tokenizer constructed for one method kind.
#[derive(Default)]
pub struct TokenizerProbe {
    attached: Mutex<Vec<String>>,
    tokenized: Mutex<Vec<TokenizeFields>>,
    tokenize_errors: Mutex<VecDeque<String>>,
    destroyed: AtomicUsize,
    fail_attach: AtomicBool,
    attach_delay: Mutex<Option<Duration>>,
}

impl TokenizerProbe {
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    pub fn tokenized(&self) -> Vec<TokenizeFields> {
        self.tokenized.lock().clone()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn fail_next_tokenize(&self, message: &str) {
        self.tokenize_errors.lock().push_back(message.to_string());
    }

    pub fn delay_attach(&self, delay: Duration) {
        *self.attach_delay.lock() = Some(delay);
    }
}

struct MockTokenizer {
    kind: MethodKind,
    probe: Arc<TokenizerProbe>,
}

#[async_trait]
impl Tokenizer for MockTokenizer {
    async fn attach(&self, container: &str) -> Result<(), SurfaceError> {
        let delay = *self.probe.attach_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.probe.fail_attach.load(Ordering::SeqCst) {
            return Err(SurfaceError::new("Container not found"));
        }
        self.probe.attached.lock().push(container.to_string());
        Ok(())
    }

    async fn tokenize(&self, fields: &TokenizeFields) -> Result<String, SurfaceError> {
        let n = {
            let mut tokenized = self.probe.tokenized.lock();
            tokenized.push(fields.clone());
            tokenized.len()
        };
        if let Some(message) = self.probe.tokenize_errors.lock().pop_front() {
            return Err(SurfaceError::new(message));
        }
        Ok(format!("tok_{}_{}", self.kind, n))
    }

    async fn destroy(&self) {
        self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
        self.probe.attached.lock().clear();
    }
}

/// Web Payments SDK stand-in with per-kind failure and delay injection.
#[derive(Default)]
pub struct MockSdk {
    probes: Mutex<HashMap<MethodKind, Arc<TokenizerProbe>>>,
    constructed: Mutex<Vec<MethodKind>>,
    failing: Mutex<HashSet<MethodKind>>,
    delays: Mutex<HashMap<MethodKind, Duration>>,
}

impl MockSdk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self, kind: MethodKind) -> Arc<TokenizerProbe> {
        self.probes.lock().entry(kind).or_default().clone()
    }

    pub fn fail_construction(&self, kind: MethodKind) {
        self.failing.lock().insert(kind);
    }

    pub fn fail_attach(&self, kind: MethodKind) {
        self.probe(kind).fail_attach.store(true, Ordering::SeqCst);
    }

    pub fn delay_construction(&self, kind: MethodKind, delay: Duration) {
        self.delays.lock().insert(kind, delay);
    }

    /// Kinds successfully constructed, in order.
    pub fn constructed(&self) -> Vec<MethodKind> {
        self.constructed.lock().clone()
    }
}

#[async_trait]
impl WebPaymentsSdk for MockSdk {
    async fn create_tokenizer(
        &self,
        _application: &SquareApplication,
        kind: MethodKind,
        _amount: Decimal,
    ) -> Result<Box<dyn Tokenizer>, SurfaceError> {
        let delay = self.delays.lock().get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&kind) {
            return Err(SurfaceError::new(format!("{kind} is not supported in this browser")));
        }
        self.constructed.lock().push(kind);
        Ok(Box::new(MockTokenizer {
            kind,
            probe: self.probe(kind),
        }))
    }
}
