//! Promo code rules.

use crate::types::{Discount, Money, PromoCodeResult};

/// Welcome code, 15% off
pub const WELCOME_CODE: &str = "WELCOME";

/// Any code starting with this prefix takes 10% off
pub const PROMO_PREFIX: &str = "PROMO";

const WELCOME_PERCENT: u8 = 15;
const PREFIX_PERCENT: u8 = 10;

/// Outcome of looking a code up, before any totals are involved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromoEvaluation {
    /// Code after trimming and upper-casing
    pub normalized: String,
    /// Whether the code was recognised
    pub is_valid: bool,
    /// Discount granted
    pub discount: Discount,
    /// Message for the buyer
    pub message: String,
}

impl PromoEvaluation {
    /// Prices the evaluation against a cart total
    #[must_use]
    pub fn against(self, total: Money) -> PromoCodeResult {
        PromoCodeResult {
            is_valid: self.is_valid,
            discount: self.discount,
            message: self.message,
            total_before_discount: total,
            total_after_discount: total.apply_discount(self.discount),
        }
    }
}

/// Evaluates a promo code
///
/// Codes are trimmed and compared case-insensitively.
#[must_use]
pub fn evaluate_promo_code(code: &str) -> PromoEvaluation {
    let normalized = code.trim().to_ascii_uppercase();

    let percent = if normalized == WELCOME_CODE {
        Some(WELCOME_PERCENT)
    } else if normalized.starts_with(PROMO_PREFIX) {
        Some(PREFIX_PERCENT)
    } else {
        None
    };

    match percent.and_then(Discount::from_percent) {
        Some(discount) => PromoEvaluation {
            message: format!("Promo code applied: {}% off", discount.percent()),
            normalized,
            is_valid: true,
            discount,
        },
        None if normalized.is_empty() => PromoEvaluation {
            normalized,
            is_valid: false,
            discount: Discount::NONE,
            message: "Please enter a promo code".to_string(),
        },
        None => PromoEvaluation {
            normalized,
            is_valid: false,
            discount: Discount::NONE,
            message: "Invalid promo code".to_string(),
        },
    }
}
