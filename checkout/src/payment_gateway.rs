//! Payment gateway seam.
//!
//! [`PaymentGateway`] abstracts a card processor with a two-step intent
//! lifecycle: create an intent for an amount, then confirm it with a card.
//! [`MockPaymentGateway`] is a deterministic in-memory fake driven by test
//! card numbers; [`StripePaymentGateway`] speaks the Stripe REST API.
//! [`gateway_from_config`] picks one from [`GatewayConfig`].

use crate::config::{GatewayConfig, GatewayKind};
use crate::types::{
    CardDetails, Currency, Money, PaymentIntentId, PaymentIntentStatus, PaymentIntentStub,
    SessionId,
};
use crate::validation::passes_luhn;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Payment gateway error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentGatewayError {
    /// Card declined
    #[error("Card declined: {reason}")]
    CardDeclined {
        /// Decline reason
        reason: String,
    },

    /// Insufficient funds
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// Invalid payment method
    #[error("Invalid payment method: {reason}")]
    InvalidPaymentMethod {
        /// Invalid reason
        reason: String,
    },

    /// Gateway timeout
    #[error("Gateway timeout")]
    Timeout,

    /// Gateway temporarily unable to process the request
    #[error("Gateway unavailable: {message}")]
    Unavailable {
        /// What went wrong
        message: String,
    },

    /// The intent is not the one the session holds, or the gateway has no such intent
    #[error("Unknown payment intent {intent_id}")]
    UnknownIntent {
        /// Intent id
        intent_id: PaymentIntentId,
    },

    /// The gateway answered with a status the checkout cannot act on
    #[error("Unexpected payment status: {status}")]
    UnexpectedStatus {
        /// Status reported by the gateway
        status: String,
    },

    /// Other error
    #[error("Payment error: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl PaymentGatewayError {
    /// True for failures worth retrying with the same request
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable { .. })
    }

    /// Short machine-readable label, used as a metric tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CardDeclined { .. } => "card_declined",
            Self::InsufficientFunds => "insufficient_funds",
            Self::InvalidPaymentMethod { .. } => "invalid_payment_method",
            Self::Timeout => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::UnknownIntent { .. } => "unknown_intent",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::Other { .. } => "other",
        }
    }
}

/// Request to open a payment intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    /// Session paying
    pub session_id: SessionId,
    /// Amount to charge
    pub amount: Money,
    /// Currency of `amount`
    pub currency: Currency,
}

impl CreateIntentRequest {
    /// Key that makes a repeated create for the same session and amount
    /// return the same intent
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("checkout-{}-{}", self.session_id, self.amount.cents())
    }
}

/// Payment gateway trait
///
/// Abstraction over card processors with an intent/confirm lifecycle.
pub trait PaymentGateway: Send + Sync {
    /// Opens an intent for an amount
    ///
    /// # Errors
    ///
    /// Returns error if the gateway rejects or cannot be reached
    fn create_intent(&self, request: CreateIntentRequest) -> GatewayFuture<PaymentIntentStub>;

    /// Confirms an intent with card details
    ///
    /// # Errors
    ///
    /// Returns error if the charge is declined or the gateway cannot be reached
    fn confirm_intent(
        &self,
        intent_id: &PaymentIntentId,
        card: &CardDetails,
    ) -> GatewayFuture<PaymentIntentStub>;
}

/// Builds the gateway selected by configuration
///
/// # Errors
///
/// Returns [`PaymentGatewayError::Other`] if the Stripe gateway is selected
/// without a secret key or its HTTP client cannot be built.
pub fn gateway_from_config(config: &GatewayConfig) -> GatewayResult<Arc<dyn PaymentGateway>> {
    match config.kind {
        GatewayKind::Mock => Ok(Arc::new(MockPaymentGateway::with_latency(
            config.mock_latency(),
        ))),
        GatewayKind::Stripe => {
            let secret_key =
                config
                    .stripe_secret_key
                    .clone()
                    .ok_or_else(|| PaymentGatewayError::Other {
                        message: "STRIPE_SECRET_KEY is not set".to_string(),
                    })?;
            Ok(Arc::new(StripePaymentGateway::new(
                config.stripe_base_url.clone(),
                secret_key,
                config.request_timeout(),
            )?))
        },
    }
}

// ============================================================================
// Mock gateway
// ============================================================================

/// Test card numbers understood by [`MockPaymentGateway`]
pub mod test_cards {
    /// Always succeeds
    pub const SUCCESS: &str = "4242424242424242";
    /// Always declined
    pub const DECLINED: &str = "4000000000000002";
    /// Declined for insufficient funds
    pub const INSUFFICIENT_FUNDS: &str = "4000000000009995";
    /// Fails with a transient processing error
    pub const PROCESSING_ERROR: &str = "4000000000000119";
}

#[derive(Debug, Default)]
struct MockLedger {
    intents: HashMap<PaymentIntentId, PaymentIntentStub>,
    by_idempotency_key: HashMap<String, PaymentIntentId>,
    injected_failures: u32,
}

/// Deterministic in-memory payment gateway
///
/// Intent ids are sequential (`pi_mock_000001`, …). The outcome of a confirm
/// depends only on the card number, see [`test_cards`]; any other number that
/// passes the Luhn check succeeds.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    latency: Duration,
    next_id: Arc<AtomicU64>,
    ledger: Arc<Mutex<MockLedger>>,
    confirm_started: Arc<Notify>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway without simulated latency
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock gateway that sleeps `latency` before answering
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Makes the next `count` calls fail with [`PaymentGatewayError::Unavailable`]
    pub fn fail_next_requests(&self, count: u32) {
        self.ledger().injected_failures = count;
    }

    /// Current state of an intent
    #[must_use]
    pub fn intent(&self, id: &PaymentIntentId) -> Option<PaymentIntentStub> {
        self.ledger().intents.get(id).cloned()
    }

    /// Number of intents created so far
    #[must_use]
    pub fn intent_count(&self) -> usize {
        self.ledger().intents.len()
    }

    /// Resolves once a confirm call has reached the gateway
    ///
    /// A confirm that started before the wait counts; each wait consumes
    /// one start.
    pub async fn confirm_started(&self) {
        self.confirm_started.notified().await;
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, MockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_failure(ledger: &mut MockLedger) -> GatewayResult<()> {
        if ledger.injected_failures > 0 {
            ledger.injected_failures -= 1;
            return Err(PaymentGatewayError::Unavailable {
                message: "simulated gateway outage".to_string(),
            });
        }
        Ok(())
    }

    fn create_now(&self, request: &CreateIntentRequest) -> GatewayResult<PaymentIntentStub> {
        let mut ledger = self.ledger();
        Self::take_injected_failure(&mut ledger)?;

        let key = request.idempotency_key();
        if let Some(existing) = ledger
            .by_idempotency_key
            .get(&key)
            .and_then(|id| ledger.intents.get(id))
        {
            return Ok(existing.clone());
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = PaymentIntentId::new(format!("pi_mock_{n:06}"));
        let intent = PaymentIntentStub {
            client_secret: format!("{id}_secret_mock"),
            id: id.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentIntentStatus::RequiresPaymentMethod,
        };
        ledger.intents.insert(id.clone(), intent.clone());
        ledger.by_idempotency_key.insert(key, id);
        Ok(intent)
    }

    fn confirm_now(
        &self,
        intent_id: &PaymentIntentId,
        digits: &str,
    ) -> GatewayResult<PaymentIntentStub> {
        let mut ledger = self.ledger();
        Self::take_injected_failure(&mut ledger)?;

        let intent = ledger
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| PaymentGatewayError::UnknownIntent {
                intent_id: intent_id.clone(),
            })?;

        match intent.status {
            PaymentIntentStatus::Succeeded => return Ok(intent.clone()),
            PaymentIntentStatus::Canceled => {
                return Err(PaymentGatewayError::UnexpectedStatus {
                    status: intent.status.to_string(),
                });
            },
            _ => {},
        }

        match digits {
            test_cards::DECLINED => Err(PaymentGatewayError::CardDeclined {
                reason: "generic_decline".to_string(),
            }),
            test_cards::INSUFFICIENT_FUNDS => Err(PaymentGatewayError::InsufficientFunds),
            test_cards::PROCESSING_ERROR => Err(PaymentGatewayError::Unavailable {
                message: "processing_error".to_string(),
            }),
            _ if !passes_luhn(digits) => Err(PaymentGatewayError::InvalidPaymentMethod {
                reason: "incorrect_number".to_string(),
            }),
            _ => {
                intent.status = PaymentIntentStatus::Succeeded;
                Ok(intent.clone())
            },
        }
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_intent(&self, request: CreateIntentRequest) -> GatewayFuture<PaymentIntentStub> {
        let gateway = self.clone();
        Box::pin(async move {
            // Simulate network delay
            if !gateway.latency.is_zero() {
                tokio::time::sleep(gateway.latency).await;
            }

            let intent = gateway.create_now(&request)?;
            tracing::info!(
                session_id = %request.session_id,
                payment_intent_id = %intent.id,
                amount = intent.amount.cents(),
                "Mock payment intent created"
            );
            Ok(intent)
        })
    }

    fn confirm_intent(
        &self,
        intent_id: &PaymentIntentId,
        card: &CardDetails,
    ) -> GatewayFuture<PaymentIntentStub> {
        let gateway = self.clone();
        let intent_id = intent_id.clone();
        let digits = card.digits();
        Box::pin(async move {
            gateway.confirm_started.notify_one();
            if !gateway.latency.is_zero() {
                tokio::time::sleep(gateway.latency).await;
            }

            let result = gateway.confirm_now(&intent_id, &digits);
            match &result {
                Ok(intent) => tracing::info!(
                    payment_intent_id = %intent.id,
                    amount = intent.amount.cents(),
                    "Mock payment confirmed"
                ),
                Err(err) => tracing::info!(
                    payment_intent_id = %intent_id,
                    error = %err,
                    "Mock payment rejected"
                ),
            }
            result
        })
    }
}

// ============================================================================
// Stripe gateway
// ============================================================================

/// Payment gateway backed by the Stripe REST API
///
/// Requests are form-encoded and authenticated with the secret key as a
/// bearer token. The base URL is configurable so the adapter can point at a
/// local stub.
#[derive(Clone, Debug)]
pub struct StripePaymentGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    client_secret: Option<String>,
    amount: u64,
    currency: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct StripeErrorDetail {
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

impl StripePaymentGateway {
    /// Creates a gateway talking to `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`PaymentGatewayError::Other`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentGatewayError::Other {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    /// Sends an authenticated request, splitting success from a Stripe
    /// error reply
    async fn execute(&self, request: reqwest::RequestBuilder) -> GatewayResult<StripeReply> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();

        if status.is_success() {
            let intent: StripeIntent = response.json().await.map_err(map_transport_error)?;
            return intent.into_stub().map(StripeReply::Intent);
        }

        let detail = response
            .json::<StripeErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_default();
        Ok(StripeReply::Rejected(status, detail))
    }

    async fn create(&self, request: &CreateIntentRequest) -> GatewayResult<PaymentIntentStub> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        let form = [
            ("amount", request.amount.cents().to_string()),
            ("currency", request.currency.code().to_ascii_lowercase()),
            ("metadata[session_id]", request.session_id.to_string()),
            ("payment_method_types[]", "card".to_string()),
        ];
        let builder = self
            .client
            .post(url)
            .header(IDEMPOTENCY_KEY, request.idempotency_key())
            .form(&form);

        match self.execute(builder).await? {
            StripeReply::Intent(intent) => Ok(intent),
            StripeReply::Rejected(status, detail) => Err(map_error_response(status, detail)),
        }
    }

    async fn confirm(
        &self,
        intent_id: &PaymentIntentId,
        card: &CardDetails,
    ) -> GatewayResult<PaymentIntentStub> {
        let url = format!("{}/v1/payment_intents/{intent_id}/confirm", self.base_url);
        let form = [
            ("payment_method_data[type]", "card".to_string()),
            ("payment_method_data[card][number]", card.digits()),
            ("payment_method_data[card][exp_month]", card.exp_month.to_string()),
            ("payment_method_data[card][exp_year]", card.exp_year.to_string()),
            ("payment_method_data[card][cvc]", card.cvc.trim().to_string()),
            (
                "payment_method_data[billing_details][name]",
                card.holder_name.trim().to_string(),
            ),
        ];
        let builder = self
            .client
            .post(url)
            .header(IDEMPOTENCY_KEY, confirm_idempotency_key(intent_id, card))
            .form(&form);

        match self.execute(builder).await? {
            StripeReply::Intent(intent) => Ok(intent),
            // A retry after a lost response finds the intent already charged
            StripeReply::Rejected(status, detail)
                if detail.code.as_deref() == Some(UNEXPECTED_STATE) =>
            {
                let intent = self.fetch(intent_id).await?;
                if intent.status == PaymentIntentStatus::Succeeded {
                    tracing::info!(payment_intent_id = %intent_id, "Stripe payment intent was already confirmed");
                    return Ok(intent);
                }
                tracing::warn!(
                    payment_intent_id = %intent_id,
                    status = %intent.status,
                    http_status = %status,
                    message = detail.message.as_deref().unwrap_or_default(),
                    "Stripe payment intent cannot be confirmed"
                );
                Err(PaymentGatewayError::UnexpectedStatus {
                    status: intent.status.to_string(),
                })
            },
            StripeReply::Rejected(status, detail) => Err(map_error_response(status, detail)),
        }
    }

    async fn fetch(&self, intent_id: &PaymentIntentId) -> GatewayResult<PaymentIntentStub> {
        let url = format!("{}/v1/payment_intents/{intent_id}", self.base_url);
        match self.execute(self.client.get(url)).await? {
            StripeReply::Intent(intent) => Ok(intent),
            StripeReply::Rejected(status, detail) => Err(map_error_response(status, detail)),
        }
    }
}

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Stripe error code for acting on an intent in the wrong state
const UNEXPECTED_STATE: &str = "payment_intent_unexpected_state";

enum StripeReply {
    Intent(PaymentIntentStub),
    Rejected(reqwest::StatusCode, StripeErrorDetail),
}

/// Key shared by every retry of one confirm with one card
///
/// A different card gets a different key, so a declined card does not
/// replay its decline for the next one. Card data never appears in the key.
fn confirm_idempotency_key(intent_id: &PaymentIntentId, card: &CardDetails) -> String {
    let material = format!(
        "{intent_id}|{}|{}|{}|{}",
        card.digits(),
        card.exp_month,
        card.exp_year,
        card.cvc.trim()
    );
    let fingerprint = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, material.as_bytes());
    format!("confirm-{intent_id}-{}", fingerprint.simple())
}

impl StripeIntent {
    fn into_stub(self) -> GatewayResult<PaymentIntentStub> {
        let status = PaymentIntentStatus::from_gateway(&self.status).ok_or_else(|| {
            PaymentGatewayError::UnexpectedStatus {
                status: self.status.clone(),
            }
        })?;
        let currency = self
            .currency
            .parse::<Currency>()
            .map_err(|message| PaymentGatewayError::Other { message })?;

        Ok(PaymentIntentStub {
            id: PaymentIntentId::new(self.id),
            client_secret: self.client_secret.unwrap_or_default(),
            amount: Money::from_cents(self.amount),
            currency,
            status,
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> PaymentGatewayError {
    if err.is_timeout() {
        PaymentGatewayError::Timeout
    } else if err.is_connect() || err.is_request() {
        PaymentGatewayError::Unavailable {
            message: err.to_string(),
        }
    } else {
        PaymentGatewayError::Other {
            message: err.to_string(),
        }
    }
}

fn map_error_response(status: reqwest::StatusCode, detail: StripeErrorDetail) -> PaymentGatewayError {
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return PaymentGatewayError::Unavailable { message };
    }

    let is_insufficient = |code: &Option<String>| code.as_deref() == Some("insufficient_funds");
    match status.as_u16() {
        402 if is_insufficient(&detail.decline_code) || is_insufficient(&detail.code) => {
            PaymentGatewayError::InsufficientFunds
        },
        402 => PaymentGatewayError::CardDeclined {
            reason: detail.decline_code.or(detail.code).unwrap_or(message),
        },
        400 => PaymentGatewayError::InvalidPaymentMethod { reason: message },
        404 => PaymentGatewayError::Other { message },
        _ => PaymentGatewayError::Other {
            message: format!("HTTP {status}: {message}"),
        },
    }
}

impl PaymentGateway for StripePaymentGateway {
    fn create_intent(&self, request: CreateIntentRequest) -> GatewayFuture<PaymentIntentStub> {
        let gateway = self.clone();
        Box::pin(async move {
            let intent = gateway.create(&request).await?;
            tracing::info!(
                session_id = %request.session_id,
                payment_intent_id = %intent.id,
                amount = intent.amount.cents(),
                "Stripe payment intent created"
            );
            Ok(intent)
        })
    }

    fn confirm_intent(
        &self,
        intent_id: &PaymentIntentId,
        card: &CardDetails,
    ) -> GatewayFuture<PaymentIntentStub> {
        let gateway = self.clone();
        let intent_id = intent_id.clone();
        let card = card.clone();
        Box::pin(async move {
            let intent = gateway.confirm(&intent_id, &card).await?;
            tracing::info!(
                payment_intent_id = %intent_id,
                status = %intent.status,
                "Stripe payment intent confirmed"
            );
            Ok(intent)
        })
    }
}
