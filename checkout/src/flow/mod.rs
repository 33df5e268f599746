//! Checkout step state machine.
//!
//! # Steps
//!
//! ```text
//! Idle            ── open ──────────▶ TicketSelection
//! TicketSelection ── proceed ───────▶ BuyerInfo        (session opened, countdown started)
//! BuyerInfo       ── validated ─────▶ PaymentInfo      (payment intent created)
//! PaymentInfo     ── back ──────────▶ BuyerInfo        (cart and discount kept)
//! PaymentInfo     ── paid ──────────▶ Completed
//! any active step ── cancel ────────▶ TicketSelection  (full reset)
//! any active step ── deadline ──────▶ Expired
//! Expired         ── return ────────▶ TicketSelection  (full reset)
//! ```
//!
//! The flow runs on a [`Store`](boxoffice_runtime::Store): the reducer decides,
//! and session calls and the countdown run as effects whose results come
//! back as [`FlowAction`]s.

pub mod actions;
pub mod environment;
pub mod reducer;
pub mod store;
pub mod types;

pub use actions::FlowAction;
pub use environment::CheckoutEnvironment;
pub use reducer::CheckoutFlowReducer;
pub use store::{CheckoutStore, checkout_store};
pub use types::{
    ActiveSession, CheckoutFlowState, CheckoutStep, FlowError, FlowErrorKind, PendingRequest,
};
