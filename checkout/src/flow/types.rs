//! State types for the checkout flow.

use crate::cart::Cart;
use crate::error::{CartError, CheckoutError, FieldErrors};
use crate::timer::Countdown;
use crate::types::{
    BuyerInfo, Discount, EventId, Money, OrderSummary, PaymentIntentHandle, PromoCodeResult,
    SessionId, Ticket,
};
use boxoffice_core::{CancellationToken, DateTime, Utc};
use std::fmt;

/// Screen the buyer is on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CheckoutStep {
    /// Event page; tickets not requested yet and no session exists
    #[default]
    Idle,
    /// Picking ticket types and quantities
    TicketSelection,
    /// Entering buyer details
    BuyerInfo,
    /// Entering card details
    PaymentInfo,
    /// Paid; the order summary is available
    Completed,
    /// The countdown ran out; only "return to event" leaves this step
    Expired,
}

impl CheckoutStep {
    /// True while a session backs the step
    #[must_use]
    pub const fn has_session(self) -> bool {
        matches!(self, Self::BuyerInfo | Self::PaymentInfo)
    }
}

impl fmt::Display for CheckoutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TicketSelection => "ticketSelection",
            Self::BuyerInfo => "buyerInfo",
            Self::PaymentInfo => "paymentInfo",
            Self::Completed => "completed",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Request the flow is waiting on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingRequest {
    /// Opening a session for the cart
    StartingSession,
    /// Server-side buyer validation
    ValidatingBuyer,
    /// Creating the payment intent
    CreatingIntent,
    /// Evaluating a promo code
    ApplyingPromo,
    /// Charging the card
    Paying,
}

/// Category of a [`FlowError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowErrorKind {
    /// Form fields were rejected; shown inline
    Validation,
    /// The charge was refused; shown as a dismissible banner
    Payment,
    /// The session is gone; the flow restarts
    NotFound,
    /// The session ran out of time
    Expired,
    /// Cart rule violated
    Cart,
    /// Anything else the service reported
    Session,
}

/// Error shown on the current step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowError {
    /// Category
    pub kind: FlowErrorKind,
    /// Message for the buyer
    pub message: String,
    /// Per-field messages (validation errors only)
    pub fields: FieldErrors,
}

impl FlowError {
    /// Field-level validation failure
    #[must_use]
    pub fn validation(fields: FieldErrors) -> Self {
        Self {
            kind: FlowErrorKind::Validation,
            message: "Please correct the highlighted fields".to_string(),
            fields,
        }
    }

    /// Error with no field detail
    #[must_use]
    pub fn new(kind: FlowErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: FieldErrors::new(),
        }
    }

    /// True when the session cannot be used any more
    #[must_use]
    pub const fn requires_reset(&self) -> bool {
        matches!(self.kind, FlowErrorKind::NotFound | FlowErrorKind::Expired)
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{} ({})", self.message, self.fields)
        }
    }
}

impl From<&CheckoutError> for FlowError {
    fn from(err: &CheckoutError) -> Self {
        match err {
            CheckoutError::Validation(fields) => Self::validation(fields.clone()),
            CheckoutError::Payment(payment) => Self::new(FlowErrorKind::Payment, payment.to_string()),
            CheckoutError::NotFound { .. } => Self::new(
                FlowErrorKind::NotFound,
                "Your checkout session could not be found. Please try again.",
            ),
            CheckoutError::Expired { .. } => {
                Self::new(FlowErrorKind::Expired, "Your checkout session has expired")
            },
            CheckoutError::Cart(cart) => Self::from(cart),
            CheckoutError::Session(_) | CheckoutError::Storage(_) => {
                Self::new(FlowErrorKind::Session, err.to_string())
            },
        }
    }
}

impl From<&CartError> for FlowError {
    fn from(err: &CartError) -> Self {
        Self::new(FlowErrorKind::Cart, err.to_string())
    }
}

/// The session backing the current checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSession {
    /// Session id
    pub id: SessionId,
    /// Shared deadline of every step
    pub expires_at: DateTime<Utc>,
    /// Cart total when the session opened
    pub total_amount: Money,
}

/// Checkout flow state
///
/// `epoch` and `token` guard asynchronous work: every request carries the
/// epoch it was started in and runs under `token`. A reset or expiry bumps
/// the epoch and cancels the token, so late results are dropped.
#[derive(Clone, Debug)]
pub struct CheckoutFlowState {
    /// Current step
    pub step: CheckoutStep,
    /// Event being booked
    pub event_id: Option<EventId>,
    /// Tickets on sale for the event
    pub catalog: Vec<Ticket>,
    /// Selected tickets
    pub cart: Cart,
    /// Cart total before discount
    pub total: Money,
    /// Discount from the last valid promo code
    pub discount: Discount,
    /// Result of the last promo code attempt
    pub promo: Option<PromoCodeResult>,
    /// Backing session, once checkout started
    pub session: Option<ActiveSession>,
    /// Validated buyer details
    pub buyer_info: Option<BuyerInfo>,
    /// Intent the card will be charged against
    pub payment_intent: Option<PaymentIntentHandle>,
    /// Receipt of a completed checkout
    pub order: Option<OrderSummary>,
    /// Request in flight
    pub pending: Option<PendingRequest>,
    /// Error shown on the current step
    pub error: Option<FlowError>,
    /// Generation of asynchronous work
    pub epoch: u64,
    /// Cancels the work of the current epoch
    pub token: CancellationToken,
}

impl Default for CheckoutFlowState {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckoutFlowState {
    /// Flow before the buyer asked for tickets
    #[must_use]
    pub fn new() -> Self {
        Self {
            step: CheckoutStep::Idle,
            event_id: None,
            catalog: Vec::new(),
            cart: Cart::new(),
            total: Money::ZERO,
            discount: Discount::NONE,
            promo: None,
            session: None,
            buyer_info: None,
            payment_intent: None,
            order: None,
            pending: None,
            error: None,
            epoch: 0,
            token: CancellationToken::new(),
        }
    }

    /// Id of the backing session
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    /// Time left on the shared deadline
    #[must_use]
    pub fn countdown(&self, now: DateTime<Utc>) -> Option<Countdown> {
        self.session
            .as_ref()
            .map(|session| Countdown::until(session.expires_at, now))
    }

    /// Total after the current discount
    #[must_use]
    pub const fn amount_due(&self) -> Money {
        self.total.apply_discount(self.discount)
    }

    /// True while a request is in flight
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Looks up a ticket type in the catalog
    #[must_use]
    pub fn ticket(&self, ticket_id: &crate::types::TicketId) -> Option<&Ticket> {
        self.catalog.iter().find(|ticket| ticket.id == *ticket_id)
    }

    /// Abandons all asynchronous work of the current epoch
    pub fn invalidate(&mut self) {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Drops everything bought or entered so far, keeping the event and its
    /// catalog
    pub fn clear_checkout(&mut self) {
        self.cart.clear();
        self.total = Money::ZERO;
        self.discount = Discount::NONE;
        self.promo = None;
        self.session = None;
        self.buyer_info = None;
        self.payment_intent = None;
        self.pending = None;
        self.error = None;
    }

    /// Full reset to ticket selection
    pub fn reset_to_selection(&mut self) {
        self.invalidate();
        self.clear_checkout();
        self.order = None;
        self.step = CheckoutStep::TicketSelection;
    }
}
