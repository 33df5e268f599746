//! Actions for the checkout flow.

use crate::flow::types::FlowError;
use crate::types::{
    BuyerInfo, BuyerInfoForm, CardDetails, EventId, OrderSummary, PaymentIntentHandle,
    PromoCodeResult, SessionInit, Ticket, TicketId,
};

/// Everything that can happen to a checkout flow.
///
/// Commands come from the buyer. Results are fed back by effects and carry
/// the epoch they were started in; results from an abandoned epoch are
/// ignored.
#[derive(Debug, Clone)]
pub enum FlowAction {
    // ========== Commands ==========
    /// Show the tickets of an event
    OpenTicketSelection {
        /// Event to book
        event_id: EventId,
        /// Tickets on sale
        catalog: Vec<Ticket>,
    },

    /// Put one ticket of a type in the cart
    AddToCart {
        /// Ticket type
        ticket_id: TicketId,
    },

    /// Set the quantity of a cart line (0 or less removes it)
    ChangeQuantity {
        /// Ticket type
        ticket_id: TicketId,
        /// New quantity
        quantity: i64,
    },

    /// Drop a cart line
    RemoveFromCart {
        /// Ticket type
        ticket_id: TicketId,
    },

    /// Open a session for the cart and move to buyer details
    ProceedToCheckout,

    /// Submit buyer details
    SubmitBuyerInfo {
        /// Raw form input
        form: BuyerInfoForm,
    },

    /// Try a promo code
    ApplyPromoCode {
        /// Code as typed
        code: String,
    },

    /// Go from payment back to buyer details
    Back,

    /// Create a payment intent again after a failed attempt
    PreparePayment,

    /// Charge the card
    SubmitPayment {
        /// Card as entered
        card: CardDetails,
    },

    /// Abandon the checkout and start over
    CancelBooking,

    /// Leave the expired or completed screen
    ReturnToEvent,

    /// Hide the current error
    DismissError,

    // ========== Results ==========
    /// A session was opened
    SessionInitialized {
        /// Epoch of the request
        epoch: u64,
        /// The new session
        init: SessionInit,
    },

    /// The service accepted the buyer details
    BuyerInfoValidated {
        /// Epoch of the request
        epoch: u64,
        /// Normalized details
        buyer_info: BuyerInfo,
    },

    /// A payment intent is ready
    PaymentIntentCreated {
        /// Epoch of the request
        epoch: u64,
        /// Intent to charge against
        intent: PaymentIntentHandle,
    },

    /// A promo code was evaluated
    PromoCodeApplied {
        /// Epoch of the request
        epoch: u64,
        /// Evaluation against the session total
        result: PromoCodeResult,
    },

    /// The card was charged
    PaymentSucceeded {
        /// Epoch of the request
        epoch: u64,
        /// Receipt
        order: OrderSummary,
    },

    /// A request failed
    RequestFailed {
        /// Epoch of the request
        epoch: u64,
        /// What went wrong
        error: FlowError,
    },

    /// The countdown reached zero
    DeadlineReached {
        /// Epoch the countdown was started in
        epoch: u64,
    },
}

impl FlowAction {
    /// Epoch of a result action, `None` for commands
    #[must_use]
    pub const fn epoch(&self) -> Option<u64> {
        match self {
            Self::SessionInitialized { epoch, .. }
            | Self::BuyerInfoValidated { epoch, .. }
            | Self::PaymentIntentCreated { epoch, .. }
            | Self::PromoCodeApplied { epoch, .. }
            | Self::PaymentSucceeded { epoch, .. }
            | Self::RequestFailed { epoch, .. }
            | Self::DeadlineReached { epoch } => Some(*epoch),
            _ => None,
        }
    }

    /// True for actions produced by effects
    #[must_use]
    pub const fn is_result(&self) -> bool {
        self.epoch().is_some()
    }
}
