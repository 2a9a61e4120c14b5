//! Common type definitions shared across the payment flow.
//!
//! This module defines:
//! - Type aliases for entity IDs ([`InvoiceId`], [`FlowId`])
//! - The [`ProviderId`] of each supported payment processor
//! - The [`MethodKind`] of payment instrument an operator can pick
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging
//! - [`to_minor_units`]: Convert a decimal amount into integer cents for processor APIs

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type InvoiceId = Uuid;
pub type FlowId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Convert a currency amount to minor units (cents), rounding half-up at the second decimal.
///
/// Returns `None` if the amount does not fit in an `i64`.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.to_i64())
}

/// External payment processor.
///
/// `Stripe` drives a hosted multi-method element bound to a remote payment session;
/// `Square` drives per-method tokenizer widgets loaded from the provider's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Stripe,
    Square,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::Stripe, ProviderId::Square];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Stripe => "stripe",
            ProviderId::Square => "square",
        }
    }

    /// The other provider, used when ordering selection previews.
    pub fn other(&self) -> ProviderId {
        match self {
            ProviderId::Stripe => ProviderId::Square,
            ProviderId::Square => ProviderId::Stripe,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of payment instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Card,
    BankDebit,
    Wallet,
}

impl MethodKind {
    /// Every session starts on card.
    pub const DEFAULT: MethodKind = MethodKind::Card;

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Card => "card",
            MethodKind::BankDebit => "bank_debit",
            MethodKind::Wallet => "wallet",
        }
    }

    /// Map a processor-reported method type onto a kind.
    ///
    /// Unrecognised types are priced as card, so they map to `Card`.
    pub fn from_reported(reported: &str) -> MethodKind {
        match reported.trim().to_ascii_lowercase().as_str() {
            "us_bank_account" | "ach" | "ach_debit" | "bank_debit" | "sepa_debit" => MethodKind::BankDebit,
            "apple_pay" | "google_pay" | "link" | "cashapp" | "wallet" => MethodKind::Wallet,
            _ => MethodKind::Card,
        }
    }

    /// Settlement for bank debits is delayed, so a successful charge leaves the invoice processing.
    pub fn settles_asynchronously(&self) -> bool {
        matches!(self, MethodKind::BankDebit)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
