//! Error types for the checkout engine.

use crate::payment_gateway::PaymentGatewayError;
use crate::types::{Currency, SessionId, TicketId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Validation messages keyed by form field
///
/// Field order is stable so messages render the same way every time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    /// No errors
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `message` against `field`
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    /// Moves every message from `other` into `self`
    pub fn extend(&mut self, other: Self) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    /// True when no field has an error
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages for one field
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// True when `field` has at least one message
    #[must_use]
    pub fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Names of the fields with errors
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `Ok(value)` when empty, otherwise `Err(self)`
    ///
    /// # Errors
    ///
    /// Returns `self` when any field has an error.
    pub fn into_result<T>(self, value: T) -> std::result::Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Cart editing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartError {
    /// The ticket type already has a cart line
    #[error("Ticket {ticket_id} is already in the cart")]
    AlreadyInCart {
        /// Ticket type
        ticket_id: TicketId,
    },

    /// The ticket type has no cart line
    #[error("Ticket {ticket_id} is not in the cart")]
    NotInCart {
        /// Ticket type
        ticket_id: TicketId,
    },

    /// The catalog has no such ticket type
    #[error("Ticket {ticket_id} is not on sale for this event")]
    UnknownTicket {
        /// Ticket type
        ticket_id: TicketId,
    },

    /// Requested more than remaining inventory
    #[error("Only {available} of ticket {ticket_id} left, requested {requested}")]
    InsufficientInventory {
        /// Ticket type
        ticket_id: TicketId,
        /// Requested quantity
        requested: u64,
        /// Remaining inventory
        available: u32,
    },

    /// Lines priced in different currencies
    #[error("Cannot mix {found} tickets into a {expected} cart")]
    CurrencyMismatch {
        /// Currency of the cart
        expected: Currency,
        /// Currency of the ticket being added
        found: Currency,
    },

    /// Total does not fit in the money type
    #[error("Cart total overflowed")]
    Overflow,
}

/// Session storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors returned by [`SessionService`](crate::session::SessionService)
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// No such session (never created, cleared, or evicted)
    #[error("Session {session_id} not found")]
    NotFound {
        /// Requested session
        session_id: SessionId,
    },

    /// Input rejected
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    /// Gateway failure
    #[error("Payment failed: {0}")]
    Payment(#[from] PaymentGatewayError),

    /// Session-level rule violated (empty cart, wrong status)
    #[error("Session error: {0}")]
    Session(String),

    /// The session's deadline passed
    #[error("Session {session_id} has expired")]
    Expired {
        /// Expired session
        session_id: SessionId,
    },

    /// Cart rule violated
    #[error(transparent)]
    Cart(#[from] CartError),

    /// Repository failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CheckoutError {
    /// True when the client can no longer use its session and must start over
    #[must_use]
    pub const fn requires_reset(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Expired { .. })
    }

    /// True for errors worth trying again unchanged
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Payment(err) => err.is_transient(),
            Self::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<FieldErrors> for CheckoutError {
    fn from(errors: FieldErrors) -> Self {
        Self::Validation(errors)
    }
}

/// Result alias for checkout operations
pub type Result<T> = std::result::Result<T, CheckoutError>;
