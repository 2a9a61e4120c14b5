//! # paydesk: Invoice Payment Flow
//!
//! `paydesk` takes an operator from "this invoice is unpaid" to "this invoice is paid" through
//! one of two card processors, Stripe or Square. It chooses the processor, brings up the
//! processor's secure input surface, keeps the processing-fee surcharge in step with the
//! payment method the operator picks, and records the result on the invoice.
//!
//! ## Overview
//!
//! Raw card and bank details never pass through this crate. Each processor supplies its own
//! browser-side inputs which turn those details into a token or confirm a payment directly with
//! the processor. What this crate owns is the orchestration around those inputs:
//!
//! - which processors are usable for the account, and whether the operator must choose
//! - the processing fee for each (processor, method kind) pair, surcharged on the invoice total
//! - keeping the remote payment amount in step when the method kind changes
//! - a single-flight submission whose success writes the invoice status exactly once
//! - releasing every widget and session on every way out of the flow
//!
//! ## Architecture
//!
//! The entry point is [`PaymentDesk::open_payment_flow`], which checks the invoice can be paid,
//! asks the backend which processors are connected, and returns a [`flow::PaymentFlow`]. The
//! flow is a state machine (selection, initializing, ready, submitting, success) that owns at
//! most one [`payment_providers::ProviderSessionHandle`] at a time.
//!
//! ### Core Components
//!
//! The **fee schedule** ([`fees`]) is a pure function of amount, processor and method kind,
//! configured per processor with flat or capped rules.
//!
//! The **provider sessions** ([`payment_providers`]) wrap each processor's input surface.
//! Stripe binds hosted elements to a session created by the backend and re-prices that session
//! in the background whenever the method kind changes; the latest change always wins. Square
//! loads its SDK script once per process, builds one tokenizer widget per supported method kind,
//! and charges the resulting token through the backend.
//!
//! The **selector** ([`selector`]) decides from connectivity whether to show a processor choice.
//!
//! The **backend and invoice contracts** ([`backend`], [`invoice`]) are traits with reqwest
//! implementations, so the flow can be exercised against in-memory doubles.
//!
//! ### Configuration
//!
//! [`config::Config`] is loaded from YAML with `PAYDESK_` environment overrides and covers the
//! backend URL, Square application details and the fee schedule. See the [`config`] module.
//!
//! ## Example
//!
//! ```ignore
//! let config = paydesk::Config::load("paydesk.yaml")?;
//! let desk = paydesk::PaymentDesk::from_config(&config, Some(stripe_elements), Some(script_host))?;
//!
//! let flow = desk.open_payment_flow(invoice, |outcome| {
//!     println!("{} charged {}", outcome.provider, outcome.amount);
//! }).await?;
//!
//! flow.choose_provider(ProviderId::Square).await?;
//! flow.select_method_kind(MethodKind::BankDebit).await?;
//! flow.submit(&PaymentDetails { account_holder_name: Some("Ada Lovelace".into()) }).await?;
//! ```

pub mod backend;
pub mod config;
pub mod desk;
pub mod fees;
pub mod flow;
pub mod invoice;
pub mod payment_providers;
pub mod selector;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use desk::{OpenError, PaymentDesk};
pub use flow::{FlowError, FlowState, PaymentFlow, SubmitResult};
pub use payment_providers::{PaymentDetails, PaymentOutcome, SessionError};
pub use types::{InvoiceId, MethodKind, ProviderId};
