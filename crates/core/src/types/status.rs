//! Checkout state machine phases.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a single checkout attempt.
///
/// ```text
/// Idle -> Validating -> FulfillingFree -> AwaitingPayment -> FulfillingPaid -> Completed
///                    \-> (no paid items) -------------------------------------> Completed
/// any in-flight phase -> Failed
/// AwaitingPayment -> Idle   (abandoned, timed out or cancelled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPhase {
    #[default]
    Idle,
    Validating,
    FulfillingFree,
    AwaitingPayment,
    FulfillingPaid,
    Completed,
    Failed,
}

impl CheckoutPhase {
    /// Whether an attempt has finished (successfully or not).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether an attempt is currently running.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        !matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }

    /// Stable lowercase name, used as a log field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::FulfillingFree => "fulfilling_free",
            Self::AwaitingPayment => "awaiting_payment",
            Self::FulfillingPaid => "fulfilling_paid",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_phases() {
        for phase in [
            CheckoutPhase::Validating,
            CheckoutPhase::FulfillingFree,
            CheckoutPhase::AwaitingPayment,
            CheckoutPhase::FulfillingPaid,
        ] {
            assert!(phase.is_in_flight(), "{phase} should be in flight");
            assert!(!phase.is_terminal());
        }
    }

    #[test]
    fn test_resting_phases() {
        assert!(!CheckoutPhase::Idle.is_in_flight());
        assert!(!CheckoutPhase::Idle.is_terminal());
        assert!(CheckoutPhase::Completed.is_terminal());
        assert!(CheckoutPhase::Failed.is_terminal());
    }

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_string(&CheckoutPhase::AwaitingPayment).unwrap_or_default();
        assert_eq!(json, "\"awaiting_payment\"");
        assert_eq!(CheckoutPhase::AwaitingPayment.to_string(), "awaiting_payment");
    }
}
