//! Processing fee schedule.
//!
//! Fees are surcharged on top of the invoice total and depend on the provider and the selected
//! method kind. Each (provider, kind) pair maps to a [`FeeRule`]; only the card rule is
//! mandatory, so any kind without its own rule is priced as card.
//!
//! Intermediate terms are kept at full precision and only the final fee is rounded to cents
//! (half-up), so the schedule never accumulates rounding drift.
//!
//! ## Configuration
//!
//! ```yaml
//! fees:
//!   stripe:
//!     card: { type: flat, rate: "0.035", fixed: "0.50" }
//!     bank_debit: { type: capped, capped_rate: "0.008", cap: "5.00", rate: "0.006", fixed: "0.20" }
//!   square:
//!     card: { type: flat, rate: "0.035", fixed: "0.50" }
//! ```

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::types::{MethodKind, ProviderId};

/// Per-kind fee formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FeeRule {
    /// `amount × rate + fixed`
    Flat { rate: Decimal, fixed: Decimal },
    /// `min(cap, amount × capped_rate) + amount × rate + fixed`
    Capped {
        capped_rate: Decimal,
        cap: Decimal,
        rate: Decimal,
        fixed: Decimal,
    },
}

impl FeeRule {
    /// 3.5% + $0.50
    pub fn standard_card() -> Self {
        FeeRule::Flat {
            rate: Decimal::new(35, 3),
            fixed: Decimal::new(50, 2),
        }
    }

    /// 0.8% capped at $5, plus 0.6% + $0.20
    pub fn standard_bank_debit() -> Self {
        FeeRule::Capped {
            capped_rate: Decimal::new(8, 3),
            cap: Decimal::new(500, 2),
            rate: Decimal::new(6, 3),
            fixed: Decimal::new(20, 2),
        }
    }

    /// Unrounded fee for `amount`.
    pub fn apply(&self, amount: Decimal) -> Decimal {
        match *self {
            FeeRule::Flat { rate, fixed } => amount * rate + fixed,
            FeeRule::Capped {
                capped_rate,
                cap,
                rate,
                fixed,
            } => (amount * capped_rate).min(cap) + amount * rate + fixed,
        }
    }

    /// Rules must not be able to produce a negative fee.
    pub fn is_valid(&self) -> bool {
        match *self {
            FeeRule::Flat { rate, fixed } => !rate.is_sign_negative() && !fixed.is_sign_negative(),
            FeeRule::Capped {
                capped_rate,
                cap,
                rate,
                fixed,
            } => [capped_rate, cap, rate, fixed].iter().all(|v| !v.is_sign_negative()),
        }
    }
}

/// Fee rules for a single provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderFees {
    /// Also used for any kind without a rule of its own
    pub card: FeeRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_debit: Option<FeeRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<FeeRule>,
}

impl Default for ProviderFees {
    fn default() -> Self {
        Self {
            card: FeeRule::standard_card(),
            bank_debit: Some(FeeRule::standard_bank_debit()),
            wallet: Some(FeeRule::standard_card()),
        }
    }
}

impl ProviderFees {
    pub fn rule_for(&self, kind: MethodKind) -> &FeeRule {
        let specific = match kind {
            MethodKind::Card => None,
            MethodKind::BankDebit => self.bank_debit.as_ref(),
            MethodKind::Wallet => self.wallet.as_ref(),
        };
        specific.unwrap_or(&self.card)
    }

    fn rules(&self) -> impl Iterator<Item = &FeeRule> {
        std::iter::once(&self.card).chain(self.bank_debit.iter()).chain(self.wallet.iter())
    }
}

/// Fee schedule for every provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeeSchedule {
    pub stripe: ProviderFees,
    pub square: ProviderFees,
}

impl FeeSchedule {
    pub fn for_provider(&self, provider: ProviderId) -> &ProviderFees {
        match provider {
            ProviderId::Stripe => &self.stripe,
            ProviderId::Square => &self.square,
        }
    }

    /// Processing fee for paying `amount` with `kind` through `provider`, in cents precision.
    ///
    /// Negative amounts are treated as zero; the result is never negative and always carries
    /// exactly two decimal places.
    pub fn compute_fee(&self, amount: Decimal, provider: ProviderId, kind: MethodKind) -> Decimal {
        let amount = amount.max(Decimal::ZERO);
        let fee = self.for_provider(provider).rule_for(kind).apply(amount).max(Decimal::ZERO);
        to_cents(fee)
    }

    /// Invoice total plus the fee for `kind`.
    pub fn grand_total(&self, amount: Decimal, provider: ProviderId, kind: MethodKind) -> Decimal {
        to_cents(amount.max(Decimal::ZERO) + self.compute_fee(amount, provider, kind))
    }

    pub fn validate(&self) -> Result<(), String> {
        for provider in ProviderId::ALL {
            if self.for_provider(provider).rules().any(|rule| !rule.is_valid()) {
                return Err(format!("fee rules for {provider} must not contain negative values"));
            }
        }
        Ok(())
    }
}

/// Round half-up to cents and pad to exactly two decimal places.
fn to_cents(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}
