//! # Box Office Checkout
//!
//! Headless checkout engine for an event-ticketing storefront.
//!
//! A buyer picks tickets, opens a time-boxed checkout session, enters buyer
//! details and pays. The pieces:
//!
//! - [`cart`]: ticket selection and totals
//! - [`session`]: session lifecycle over a [`repository`] and a
//!   [`payment_gateway`]
//! - [`flow`]: the step state machine, a reducer run by the
//!   [`Store`](boxoffice_runtime::Store)
//! - [`timer`]: the shared countdown every step reads
//! - [`promo`] and [`validation`]: pure rules for codes, buyer and card input
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_checkout::flow::{checkout_store, CheckoutEnvironment, FlowAction};
//!
//! let store = checkout_store(CheckoutEnvironment::new(sessions, clock));
//! store.send(FlowAction::OpenTicketSelection { event_id, catalog }).await?;
//! store.send(FlowAction::AddToCart { ticket_id: "1".into() }).await?;
//! store.send(FlowAction::ProceedToCheckout).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cart;
pub mod config;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod payment_gateway;
pub mod promo;
pub mod repository;
pub mod session;
pub mod timer;
pub mod types;
pub mod validation;

pub use cart::Cart;
pub use config::Config;
pub use error::{CartError, CheckoutError, FieldErrors, StorageError};
pub use flow::{CheckoutEnvironment, CheckoutFlowReducer, CheckoutFlowState, CheckoutStep, FlowAction};
pub use payment_gateway::{MockPaymentGateway, PaymentGateway, PaymentGatewayError};
pub use repository::{FileSessionRepository, InMemorySessionRepository, SessionRepository};
pub use session::{SessionService, SessionSettings};
pub use types::{
    BuyerInfo, BuyerInfoForm, CardDetails, CartItem, Currency, Discount, EventId, Money,
    OrderSummary, PromoCodeResult, Session, SessionId, SessionStatus, Ticket, TicketId,
};
