//! Domain types for the checkout engine.
//!
//! Identifiers, value objects (money, currency, discounts), catalog entries,
//! the persisted checkout [`Session`] and the order summary handed to
//! downstream collaborators once payment succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event (concert, match, conference)
    EventId
);
uuid_id!(
    /// Unique identifier for a checkout session
    SessionId
);
uuid_id!(
    /// Unique identifier for a completed order
    OrderId
);

/// Catalog identifier of a ticket type (e.g. `"1"`, `"vip"`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    /// Creates a new `TicketId`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u32> for TicketId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway-assigned identifier of a payment intent (e.g. `pi_3Mtw…`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentIntentId(String);

impl PaymentIntentId {
    /// Creates a new `PaymentIntentId`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentIntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money Value Object (minor units to avoid floating point errors)
// ============================================================================

/// Represents money in minor units (cents)
///
/// Serialized as a decimal string (`"29.00"`), parsed from `"29"`, `"29.5"`
/// or `"29.00"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole units, `None` on overflow
    #[must_use]
    pub const fn checked_from_units(units: u64) -> Option<Self> {
        match units.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts, saturating at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiplies money by a quantity with overflow checking
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Amount left after taking `discount` off, rounding the discount down
    #[must_use]
    pub const fn apply_discount(self, discount: Discount) -> Self {
        // percent <= 100, so the product only overflows above u64::MAX / 100
        let off = match self.0.checked_mul(discount.percent() as u64) {
            Some(product) => product / 100,
            None => self.0 / 100 * discount.percent() as u64,
        };
        Self(self.0 - off)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Error parsing a decimal amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{0}': expected a non-negative decimal with at most two fraction digits")]
pub struct ParseMoneyError(String);

impl FromStr for Money {
    type Err = ParseMoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMoneyError(s.to_string());
        let trimmed = s.trim();
        let (units, fraction) = match trimmed.split_once('.') {
            // A dot needs digits after it
            Some((_, "")) => return Err(err()),
            Some(parts) => parts,
            None => (trimmed, ""),
        };

        if units.is_empty()
            || !units.bytes().all(|b| b.is_ascii_digit())
            || fraction.len() > 2
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }

        let units: u64 = units.parse().map_err(|_| err())?;
        let cents: u64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().map_err(|_| err())? * 10,
            _ => fraction.parse().map_err(|_| err())?,
        };

        Self::checked_from_units(units)
            .and_then(|m| m.checked_add(Self(cents)))
            .ok_or_else(err)
    }
}

impl TryFrom<String> for Money {
    type Error = ParseMoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Money> for String {
    fn from(money: Money) -> Self {
        money.to_string()
    }
}

/// ISO-4217 style currency code (three uppercase letters)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// US dollars
    #[must_use]
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// Returns the code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(format!("invalid currency code '{s}'"))
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discount as a whole percentage (0–100)
///
/// Serialized as a fraction between 0 and 1 (`0.15` for 15%).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Discount(u8);

impl Discount {
    /// No discount
    pub const NONE: Self = Self(0);

    /// Creates a discount from a percentage, `None` above 100
    #[must_use]
    pub const fn from_percent(percent: u8) -> Option<Self> {
        if percent <= 100 { Some(Self(percent)) } else { None }
    }

    /// The percentage
    #[must_use]
    pub const fn percent(&self) -> u8 {
        self.0
    }

    /// The discount as a fraction between 0 and 1
    #[must_use]
    pub fn fraction(&self) -> f64 {
        f64::from(self.0) / 100.0
    }

    /// True when nothing is taken off
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<f64> for Discount {
    type Error = String;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_from(fraction: f64) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(format!("discount {fraction} is outside 0..=1"));
        }
        Ok(Self((fraction * 100.0).round() as u8))
    }
}

impl From<Discount> for f64 {
    fn from(discount: Discount) -> Self {
        discount.fraction()
    }
}

// ============================================================================
// Catalog and Cart Entities
// ============================================================================

/// A purchasable ticket type from the event catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Catalog id
    pub id: TicketId,
    /// Display name (e.g. "General Admission")
    pub name: String,
    /// Longer description
    #[serde(default)]
    pub description: String,
    /// Unit price
    pub price: Money,
    /// Currency of `price`
    pub currency: Currency,
    /// Remaining inventory
    pub available: u32,
}

impl Ticket {
    /// Creates a new `Ticket` with an empty description
    #[must_use]
    pub fn new(
        id: impl Into<TicketId>,
        name: impl Into<String>,
        price: Money,
        currency: Currency,
        available: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            price,
            currency,
            available,
        }
    }

    /// Sets the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A cart line: a ticket type and the requested quantity (always ≥ 1)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// The ticket type
    pub ticket: Ticket,
    /// Requested quantity
    pub quantity: u32,
}

impl CartItem {
    /// Price of the whole line, `None` on overflow
    #[must_use]
    pub const fn line_total(&self) -> Option<Money> {
        self.ticket.price.checked_multiply(self.quantity)
    }
}

// ============================================================================
// Buyer
// ============================================================================

/// Raw buyer details as typed into the checkout form
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerInfoForm {
    /// First name
    pub first_name: String,
    /// Last name
    pub last_name: String,
    /// Email address
    pub email: String,
    /// Phone number in any common notation
    pub phone: String,
}

/// A phone number normalized to E.164
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    /// `+` followed by 8–15 digits
    pub e164: String,
    /// ISO 3166-1 alpha-2 country detected from the calling code
    pub country: Option<String>,
}

/// Validated buyer details
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerInfo {
    /// First name
    pub first_name: String,
    /// Last name
    pub last_name: String,
    /// Email address (lowercased)
    pub email: String,
    /// Normalized phone number
    pub phone: PhoneNumber,
}

// ============================================================================
// Payment
// ============================================================================

/// Status of a payment intent, mirroring a card gateway's lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    /// Waiting for card details
    RequiresPaymentMethod,
    /// Card attached, waiting for confirmation
    RequiresConfirmation,
    /// Extra customer action (3-D Secure) needed
    RequiresAction,
    /// Gateway is still working on it
    Processing,
    /// Charge captured
    Succeeded,
    /// Intent abandoned
    Canceled,
}

impl PaymentIntentStatus {
    /// Parse a gateway status string
    #[must_use]
    pub fn from_gateway(status: &str) -> Option<Self> {
        match status {
            "requires_payment_method" => Some(Self::RequiresPaymentMethod),
            "requires_confirmation" => Some(Self::RequiresConfirmation),
            "requires_action" => Some(Self::RequiresAction),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentIntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Gateway-side payment object attached to a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentStub {
    /// Gateway id
    pub id: PaymentIntentId,
    /// Opaque token the client uses to confirm the intent
    pub client_secret: String,
    /// Amount to charge
    pub amount: Money,
    /// Currency of `amount`
    pub currency: Currency,
    /// Current status
    pub status: PaymentIntentStatus,
}

/// What the client needs to collect payment for a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentHandle {
    /// Gateway id of the intent
    pub payment_intent_id: PaymentIntentId,
    /// Client secret
    pub client_secret: String,
    /// Amount that will be charged
    pub amount: Money,
    /// Currency of `amount`
    pub currency: Currency,
}

/// Card details entered at the payment step
///
/// `Debug` never prints the full number or the CVC.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    /// Name printed on the card
    pub holder_name: String,
    /// Card number (spaces and dashes allowed)
    pub number: String,
    /// Expiry month, 1–12
    pub exp_month: u32,
    /// Expiry year, four digits
    pub exp_year: i32,
    /// Security code
    pub cvc: String,
}

impl CardDetails {
    /// The card number with separators removed
    #[must_use]
    pub fn digits(&self) -> String {
        self.number.chars().filter(char::is_ascii_digit).collect()
    }

    /// Last four digits of the card number
    #[must_use]
    pub fn last4(&self) -> String {
        let digits = self.digits();
        digits[digits.len().saturating_sub(4)..].to_string()
    }
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDetails")
            .field("holder_name", &self.holder_name)
            .field("number", &format_args!("****{}", self.last4()))
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("cvc", &"***")
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Lifecycle status of a checkout session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created from a cart
    Initialized,
    /// Buyer details accepted
    BuyerInfoValidated,
    /// Payment intent created at the gateway
    PaymentIntentCreated,
    /// Charge captured
    PaymentSucceeded,
    /// Deadline passed
    Expired,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::BuyerInfoValidated => "buyer_info_validated",
            Self::PaymentIntentCreated => "payment_intent_created",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One checkout attempt, persisted in the session repository
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Event the tickets are for
    pub event_id: EventId,
    /// Snapshot of the cart when the session was created
    pub cart: Vec<CartItem>,
    /// Cart total before discount
    pub total_amount: Money,
    /// Currency of all amounts
    pub currency: Currency,
    /// Discount applied through a promo code
    #[serde(default)]
    pub discount: Discount,
    /// The promo code that produced `discount`
    #[serde(default)]
    pub promo_code: Option<String>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session stops accepting changes
    pub expires_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Buyer details once validated
    #[serde(default)]
    pub buyer_info: Option<BuyerInfo>,
    /// Gateway payment intent once created
    #[serde(default)]
    pub payment_intent: Option<PaymentIntentStub>,
}

impl Session {
    /// Time left before `expires_at`, zero once passed
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    /// True once `now` has reached `expires_at`
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Amount to charge: total minus discount
    #[must_use]
    pub const fn amount_due(&self) -> Money {
        self.total_amount.apply_discount(self.discount)
    }

    /// Number of tickets in the session
    #[must_use]
    pub fn ticket_count(&self) -> u32 {
        self.cart.iter().fold(0u32, |n, item| n.saturating_add(item.quantity))
    }
}

/// Result of creating a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    /// The new session
    pub session_id: SessionId,
    /// Deadline shared by every checkout step
    pub expires_at: DateTime<Utc>,
    /// Cart total
    pub total_amount: Money,
}

/// Snapshot returned by a status query
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    /// Current status
    pub status: SessionStatus,
    /// Time left (zero once expired)
    pub time_remaining: std::time::Duration,
    /// True once the deadline has passed
    pub is_expired: bool,
}

/// Outcome of applying a promo code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoCodeResult {
    /// Whether the code was recognised
    pub is_valid: bool,
    /// Discount granted (zero when invalid)
    pub discount: Discount,
    /// Message for the buyer
    pub message: String,
    /// Cart total before the discount
    pub total_before_discount: Money,
    /// Cart total after the discount
    pub total_after_discount: Money,
}

// ============================================================================
// Order
// ============================================================================

/// A purchased line on the order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    /// Ticket type
    pub ticket_id: TicketId,
    /// Tickets bought
    pub quantity: u32,
    /// Unit price
    pub price: Money,
    /// Ticket name
    pub name: String,
}

/// Order handed to confirmation/receipt collaborators after payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    /// Order id
    pub order_id: OrderId,
    /// Session that produced the order
    pub session_id: SessionId,
    /// Event the tickets are for
    pub event_id: EventId,
    /// Purchased lines
    pub tickets: Vec<OrderLine>,
    /// Total before discount
    pub subtotal: Money,
    /// Discount applied
    pub discount: Discount,
    /// Amount charged
    pub total_amount: Money,
    /// Currency of all amounts
    pub currency: Currency,
    /// Buyer
    pub buyer_info: BuyerInfo,
    /// Gateway intent that captured the charge
    pub payment_intent_id: PaymentIntentId,
    /// When payment was confirmed
    pub paid_at: DateTime<Utc>,
}
