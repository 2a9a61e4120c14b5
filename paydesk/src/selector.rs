//! Provider selection.
//!
//! Decides, from the connectivity report, whether the operator has to pick a processor at all.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::{
    backend::ConnectivityStatus,
    fees::FeeSchedule,
    payment_providers::ProviderSurfaces,
    types::{MethodKind, ProviderId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProviderSelection {
    NoProviderConnected,
    /// Exactly one processor is usable; selection is skipped.
    SingleProviderImplied { provider: ProviderId },
    ChoiceRequired { default: ProviderId },
}

impl ProviderSelection {
    /// A provider counts as connected only if the account reports it and the embedder supplied its
    /// browser surface.
    pub fn from_connectivity(status: &ConnectivityStatus, default: ProviderId, surfaces: &ProviderSurfaces) -> Self {
        let usable = |provider: ProviderId| {
            let connected = match provider {
                ProviderId::Stripe => status.stripe_connected,
                ProviderId::Square => status.square_connected,
            };
            connected && surfaces.supports(provider)
        };

        match (usable(ProviderId::Stripe), usable(ProviderId::Square)) {
            (true, true) => ProviderSelection::ChoiceRequired { default },
            (true, false) => ProviderSelection::SingleProviderImplied {
                provider: ProviderId::Stripe,
            },
            (false, true) => ProviderSelection::SingleProviderImplied {
                provider: ProviderId::Square,
            },
            (false, false) => ProviderSelection::NoProviderConnected,
        }
    }

    /// Back from a session returns to selection only when selection was shown.
    pub fn allows_back(&self) -> bool {
        matches!(self, ProviderSelection::ChoiceRequired { .. })
    }

    pub fn is_selectable(&self, provider: ProviderId) -> bool {
        match self {
            ProviderSelection::NoProviderConnected => false,
            ProviderSelection::SingleProviderImplied { provider: only } => *only == provider,
            ProviderSelection::ChoiceRequired { .. } => true,
        }
    }

    /// Price previews at the default method kind, default provider first.
    pub fn previews(&self, invoice_total: Decimal, fees: &FeeSchedule) -> Vec<ProviderPreview> {
        let order = match *self {
            ProviderSelection::NoProviderConnected => vec![],
            ProviderSelection::SingleProviderImplied { provider } => vec![provider],
            ProviderSelection::ChoiceRequired { default } => vec![default, default.other()],
        };
        order
            .into_iter()
            .map(|provider| ProviderPreview::new(provider, invoice_total, fees))
            .collect()
    }
}

/// What paying through a provider would cost at its default method kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderPreview {
    pub provider: ProviderId,
    pub method_kind: MethodKind,
    pub fee: Decimal,
    pub grand_total: Decimal,
}

impl ProviderPreview {
    fn new(provider: ProviderId, invoice_total: Decimal, fees: &FeeSchedule) -> Self {
        let kind = MethodKind::DEFAULT;
        Self {
            provider,
            method_kind: kind,
            fee: fees.compute_fee(invoice_total, provider, kind),
            grand_total: fees.grand_total(invoice_total, provider, kind),
        }
    }
}
