//! Checkout session service.
//!
//! Creates, updates and expires [`Session`]s over an injected
//! [`SessionRepository`] and [`PaymentGateway`]. Read-modify-write cycles are
//! serialized per session id, so two callers sharing storage cannot lose each
//! other's updates.
//!
//! Every operation except [`SessionService::get_session_status`],
//! [`SessionService::expire_session`] and [`SessionService::clear_session`]
//! refuses to touch a session whose deadline has passed.

use crate::cart::Cart;
use crate::config::Config;
use crate::error::{CheckoutError, Result};
use crate::metrics;
use crate::payment_gateway::{CreateIntentRequest, PaymentGateway, PaymentGatewayError};
use crate::promo::evaluate_promo_code;
use crate::repository::SessionRepository;
use crate::types::{
    BuyerInfo, BuyerInfoForm, CardDetails, Currency, Discount, EventId, OrderId, OrderLine,
    OrderSummary, PaymentIntentHandle, PaymentIntentId, PaymentIntentStatus, PromoCodeResult,
    Session, SessionId, SessionInit, SessionStatus, SessionStatusReport,
};
use crate::validation;
use boxoffice_core::environment::Clock;
use boxoffice_runtime::retry::{RetryPolicy, retry_transient};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

type SessionLocks = std::sync::Mutex<HashMap<SessionId, Arc<Mutex<()>>>>;

/// Tunables of the session service
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Session lifetime (default: 10 minutes)
    pub ttl: chrono::Duration,
    /// Artificial delay before each operation (default: none)
    pub latency: Duration,
    /// Retry of transient gateway failures
    pub retry: RetryPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(10),
            latency: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionSettings {
    /// Settings from application configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: config.session.ttl(),
            latency: config.session.latency(),
            retry: config.retry.policy(),
        }
    }
}

/// Session lifecycle operations
pub struct SessionService {
    repository: Arc<dyn SessionRepository>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    locks: SessionLocks,
}

impl SessionService {
    /// Service with default settings
    #[must_use]
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            gateway,
            clock,
            settings: SessionSettings::default(),
            locks: SessionLocks::default(),
        }
    }

    /// Replaces the settings
    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Current settings
    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Opens a session for `cart`, expiring one TTL from now
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Session`] for an empty cart
    /// - [`CheckoutError::Cart`] if the total overflows
    /// - [`CheckoutError::Storage`] if the session cannot be saved
    #[tracing::instrument(skip(self, cart), fields(lines = cart.len()))]
    pub async fn initialize_session(&self, cart: &Cart, event_id: EventId) -> Result<SessionInit> {
        self.simulate_latency().await;

        if cart.is_empty() {
            tracing::warn!(%event_id, "Refusing to start checkout with an empty cart");
            return Err(CheckoutError::Session(
                "Cannot start checkout with an empty cart".to_string(),
            ));
        }

        let total_amount = cart.total()?;
        let now = self.clock.now();
        let session = Session {
            id: SessionId::new(),
            event_id,
            cart: cart.to_items(),
            total_amount,
            currency: cart.currency().cloned().unwrap_or_else(Currency::usd),
            discount: Discount::NONE,
            promo_code: None,
            created_at: now,
            expires_at: now + self.settings.ttl,
            status: SessionStatus::Initialized,
            buyer_info: None,
            payment_intent: None,
        };
        self.repository.put(&session).await?;

        metrics::record_session_created();
        tracing::info!(
            session_id = %session.id,
            total = %total_amount,
            tickets = session.ticket_count(),
            expires_at = %session.expires_at,
            "Checkout session created"
        );

        Ok(SessionInit {
            session_id: session.id,
            expires_at: session.expires_at,
            total_amount,
        })
    }

    /// Validates buyer details and attaches them to the session
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] / [`CheckoutError::Expired`] for an unusable session
    /// - [`CheckoutError::Validation`] listing every bad field
    #[tracing::instrument(skip(self, form))]
    pub async fn validate_buyer_info(
        &self,
        session_id: &SessionId,
        form: &BuyerInfoForm,
    ) -> Result<BuyerInfo> {
        self.simulate_latency().await;
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load_active(session_id).await?;
        Self::ensure_unpaid(&session)?;

        let buyer = validation::validate_buyer_info(form).map_err(|errors| {
            tracing::debug!(fields = %errors, "Buyer info rejected");
            CheckoutError::Validation(errors)
        })?;

        session.buyer_info = Some(buyer.clone());
        session.status = SessionStatus::BuyerInfoValidated;
        self.repository.put(&session).await?;

        tracing::info!(
            session_id = %session.id,
            country = buyer.phone.country.as_deref().unwrap_or("unknown"),
            "Buyer info validated"
        );
        Ok(buyer)
    }

    /// Opens a payment intent for the discounted total
    ///
    /// Transient gateway failures are retried per the configured policy.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] / [`CheckoutError::Expired`] for an unusable session
    /// - [`CheckoutError::Session`] before buyer info is validated or after payment
    /// - [`CheckoutError::Payment`] when the gateway refuses
    #[tracing::instrument(skip(self))]
    pub async fn create_payment_intent(&self, session_id: &SessionId) -> Result<PaymentIntentHandle> {
        self.simulate_latency().await;
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load_active(session_id).await?;
        Self::ensure_unpaid(&session)?;
        if session.buyer_info.is_none() {
            return Err(CheckoutError::Session(
                "Buyer information must be validated before payment".to_string(),
            ));
        }

        let request = CreateIntentRequest {
            session_id: session.id,
            amount: session.amount_due(),
            currency: session.currency.clone(),
        };
        let intent = retry_transient(
            &self.settings.retry,
            "create_payment_intent",
            || self.gateway.create_intent(request.clone()),
            PaymentGatewayError::is_transient,
        )
        .await?;

        let handle = PaymentIntentHandle {
            payment_intent_id: intent.id.clone(),
            client_secret: intent.client_secret.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
        };
        session.payment_intent = Some(intent);
        session.status = SessionStatus::PaymentIntentCreated;
        self.repository.put(&session).await?;

        tracing::info!(
            session_id = %session.id,
            payment_intent_id = %handle.payment_intent_id,
            amount = %handle.amount,
            "Payment intent attached"
        );
        Ok(handle)
    }

    /// Marks the session paid and produces the order
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] / [`CheckoutError::Expired`] for an unusable session
    /// - [`CheckoutError::Payment`] if `payment_intent_id` is not the session's intent
    /// - [`CheckoutError::Session`] if already paid or buyer info is missing
    #[tracing::instrument(skip(self))]
    pub async fn confirm_payment_success(
        &self,
        session_id: &SessionId,
        payment_intent_id: &PaymentIntentId,
    ) -> Result<OrderSummary> {
        self.simulate_latency().await;
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load_active(session_id).await?;
        Self::ensure_unpaid(&session)?;
        Self::ensure_intent(&session, payment_intent_id)?;

        let buyer_info = session.buyer_info.clone().ok_or_else(|| {
            CheckoutError::Session("Buyer information is missing".to_string())
        })?;

        if let Some(intent) = session.payment_intent.as_mut() {
            intent.status = PaymentIntentStatus::Succeeded;
        }
        session.status = SessionStatus::PaymentSucceeded;

        let paid_at = self.clock.now();
        let order = OrderSummary {
            order_id: OrderId::new(),
            session_id: session.id,
            event_id: session.event_id,
            tickets: session
                .cart
                .iter()
                .map(|item| OrderLine {
                    ticket_id: item.ticket.id.clone(),
                    quantity: item.quantity,
                    price: item.ticket.price,
                    name: item.ticket.name.clone(),
                })
                .collect(),
            subtotal: session.total_amount,
            discount: session.discount,
            total_amount: session.amount_due(),
            currency: session.currency.clone(),
            buyer_info,
            payment_intent_id: payment_intent_id.clone(),
            paid_at,
        };
        self.repository.put(&session).await?;

        let duration = (paid_at - session.created_at).to_std().unwrap_or_default();
        metrics::record_session_completed(
            session.ticket_count(),
            order.total_amount.cents(),
            duration.as_secs_f64(),
        );
        tracing::info!(
            session_id = %session.id,
            order_id = %order.order_id,
            total = %order.total_amount,
            "Payment confirmed, order created"
        );
        Ok(order)
    }

    /// Charges `card` through the gateway, then confirms the session
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Validation`] for malformed card details
    /// - [`CheckoutError::NotFound`] / [`CheckoutError::Expired`] for an unusable session
    /// - [`CheckoutError::Payment`] when the charge is refused
    #[tracing::instrument(skip(self, card))]
    pub async fn pay(
        &self,
        session_id: &SessionId,
        payment_intent_id: &PaymentIntentId,
        card: &CardDetails,
    ) -> Result<OrderSummary> {
        validation::validate_card(card, self.clock.now())?;

        {
            let _guard = self.lock_session(session_id).await;
            let session = self.load_active(session_id).await?;
            Self::ensure_unpaid(&session)?;
            Self::ensure_intent(&session, payment_intent_id)?;
        }

        let confirmed = retry_transient(
            &self.settings.retry,
            "confirm_payment",
            || self.gateway.confirm_intent(payment_intent_id, card),
            PaymentGatewayError::is_transient,
        )
        .await
        .map_err(|err| {
            metrics::record_payment_failed(err.kind());
            tracing::warn!(%session_id, error = %err, "Payment rejected");
            err
        })?;

        if confirmed.status != PaymentIntentStatus::Succeeded {
            let err = PaymentGatewayError::UnexpectedStatus {
                status: confirmed.status.to_string(),
            };
            metrics::record_payment_failed(err.kind());
            tracing::warn!(%session_id, status = %confirmed.status, "Payment not completed");
            return Err(err.into());
        }

        self.confirm_payment_success(session_id, payment_intent_id)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    %session_id,
                    %payment_intent_id,
                    error = %err,
                    "Charge captured but the session could not be completed"
                );
            })
    }

    /// Applies a promo code, persisting the discount when valid
    ///
    /// A new discount invalidates a payment intent priced without it; the
    /// session drops back to `buyer_info_validated` so a fresh intent is
    /// created.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] / [`CheckoutError::Expired`] for an unusable session
    /// - [`CheckoutError::Session`] after payment
    #[tracing::instrument(skip(self))]
    pub async fn apply_promo_code(
        &self,
        session_id: &SessionId,
        code: &str,
    ) -> Result<PromoCodeResult> {
        self.simulate_latency().await;
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load_active(session_id).await?;
        Self::ensure_unpaid(&session)?;

        let evaluation = evaluate_promo_code(code);
        metrics::record_promo_code(evaluation.is_valid);

        if evaluation.is_valid {
            let changed = session.discount != evaluation.discount;
            session.discount = evaluation.discount;
            session.promo_code = Some(evaluation.normalized.clone());
            if changed && session.payment_intent.take().is_some() {
                session.status = SessionStatus::BuyerInfoValidated;
                tracing::debug!(session_id = %session.id, "Dropped payment intent priced before discount");
            }
            self.repository.put(&session).await?;
        }

        tracing::info!(
            session_id = %session.id,
            code = %evaluation.normalized,
            valid = evaluation.is_valid,
            discount_percent = evaluation.discount.percent(),
            "Promo code evaluated"
        );
        Ok(evaluation.against(session.total_amount))
    }

    /// Reports status and time left, flipping the session to expired once
    /// its deadline has passed
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] if absent
    #[tracing::instrument(skip(self))]
    pub async fn get_session_status(&self, session_id: &SessionId) -> Result<SessionStatusReport> {
        self.simulate_latency().await;
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id).await?;

        let time_remaining = session.time_remaining(self.clock.now());
        if time_remaining.is_zero() && Self::is_live(&session) {
            self.mark_expired(&mut session).await?;
        }

        Ok(SessionStatusReport {
            status: session.status,
            time_remaining,
            is_expired: session.status == SessionStatus::Expired,
        })
    }

    /// Marks the session expired regardless of its deadline
    ///
    /// Paid sessions are left alone.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] if absent
    #[tracing::instrument(skip(self))]
    pub async fn expire_session(&self, session_id: &SessionId) -> Result<()> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id).await?;
        if Self::is_live(&session) {
            self.mark_expired(&mut session).await?;
        }
        Ok(())
    }

    /// Deletes the session, returning whether it existed
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Storage`] if the repository fails
    #[tracing::instrument(skip(self))]
    pub async fn clear_session(&self, session_id: &SessionId) -> Result<bool> {
        let _guard = self.lock_session(session_id).await;
        let session = self.repository.get(session_id).await?;
        if session.as_ref().is_some_and(Self::is_live) {
            metrics::record_session_cancelled();
        }
        let existed = self.repository.delete(session_id).await?;

        tracing::debug!(%session_id, existed, "Checkout session cleared");
        Ok(existed)
    }

    /// Deletes unpaid sessions whose deadline passed more than `grace` ago,
    /// returning how many went
    ///
    /// Sessions still live at their deadline are counted as expired.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Storage`] if the repository fails
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self, grace: chrono::Duration) -> Result<usize> {
        let cutoff = self.clock.now() - grace;
        let purged = self.repository.purge_expired(cutoff).await?;
        if !purged.is_empty() {
            metrics::record_sessions_purged(purged.len());
            tracing::info!(count = purged.len(), %cutoff, "Purged expired checkout sessions");
        }
        Ok(purged.len())
    }

    /// Runs [`SessionService::purge_expired`] every `every` until the
    /// returned task is aborted
    #[must_use]
    pub fn spawn_purge_task(
        self: Arc<Self>,
        every: Duration,
        grace: chrono::Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if let Err(err) = self.purge_expired(grace).await {
                    tracing::warn!(error = %err, "Expired session purge failed");
                }
            }
        })
    }

    /// Reads a session as stored, without any expiry check
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::NotFound`] if absent
    pub async fn session(&self, session_id: &SessionId) -> Result<Session> {
        self.load(session_id).await
    }

    async fn simulate_latency(&self) {
        if !self.settings.latency.is_zero() {
            tokio::time::sleep(self.settings.latency).await;
        }
    }

    async fn lock_session(&self, session_id: &SessionId) -> SessionLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(*session_id).or_default())
        };
        SessionLock {
            locks: &self.locks,
            session_id: *session_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        self.repository
            .get(session_id)
            .await?
            .ok_or(CheckoutError::NotFound {
                session_id: *session_id,
            })
    }

    async fn load_active(&self, session_id: &SessionId) -> Result<Session> {
        let mut session = self.load(session_id).await?;

        if session.status == SessionStatus::Expired {
            return Err(CheckoutError::Expired {
                session_id: *session_id,
            });
        }
        if Self::is_live(&session) && session.is_past_deadline(self.clock.now()) {
            self.mark_expired(&mut session).await?;
            return Err(CheckoutError::Expired {
                session_id: *session_id,
            });
        }
        Ok(session)
    }

    async fn mark_expired(&self, session: &mut Session) -> Result<()> {
        session.status = SessionStatus::Expired;
        self.repository.put(session).await?;
        metrics::record_session_expired();
        tracing::info!(session_id = %session.id, expires_at = %session.expires_at, "Checkout session expired");
        Ok(())
    }

    const fn is_live(session: &Session) -> bool {
        !matches!(
            session.status,
            SessionStatus::Expired | SessionStatus::PaymentSucceeded
        )
    }

    fn ensure_unpaid(session: &Session) -> Result<()> {
        if session.status == SessionStatus::PaymentSucceeded {
            return Err(CheckoutError::Session(
                "This checkout has already been paid".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_intent(session: &Session, payment_intent_id: &PaymentIntentId) -> Result<()> {
        match &session.payment_intent {
            Some(intent) if intent.id == *payment_intent_id => Ok(()),
            _ => Err(PaymentGatewayError::UnknownIntent {
                intent_id: payment_intent_id.clone(),
            }
            .into()),
        }
    }
}

/// Exclusive hold on one session id
///
/// Dropping the last holder of an id removes its entry from the lock map.
struct SessionLock<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold a clone of the entry
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::payment_gateway::{MockPaymentGateway, test_cards};
    use crate::repository::InMemorySessionRepository;
    use crate::types::{Money, Ticket, TicketId};
    use boxoffice_testing::{ManualClock, test_time};

    struct Fixture {
        service: SessionService,
        clock: ManualClock,
        gateway: MockPaymentGateway,
        repository: Arc<InMemorySessionRepository>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(test_time());
        let gateway = MockPaymentGateway::new();
        let repository = Arc::new(InMemorySessionRepository::new());
        let service = SessionService::new(
            repository.clone(),
            Arc::new(gateway.clone()),
            Arc::new(clock.clone()),
        )
        .with_settings(SessionSettings {
            retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .build(),
            ..SessionSettings::default()
        });
        Fixture {
            service,
            clock,
            gateway,
            repository,
        }
    }

    fn cart() -> Cart {
        let mut cart = Cart::new();
        let general =
            Ticket::new(1u32, "General Admission", Money::from_cents(2900), Currency::usd(), 100);
        let vip = Ticket::new(3u32, "VIP", Money::from_cents(7900), Currency::usd(), 10);
        cart.add_to_cart(general).unwrap();
        cart.add_to_cart(vip).unwrap();
        cart.change_quantity(&TicketId::from(1u32), 2).unwrap();
        cart
    }

    fn buyer() -> BuyerInfoForm {
        BuyerInfoForm {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            phone: "+1 555 123 4567".to_string(),
        }
    }

    fn card(number: &str) -> CardDetails {
        CardDetails {
            holder_name: "Ada Lovelace".to_string(),
            number: number.to_string(),
            exp_month: 12,
            exp_year: 2030,
            cvc: "123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_session_computes_total_and_deadline() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();

        assert_eq!(init.total_amount, Money::from_cents(13700));
        assert_eq!(init.expires_at, test_time() + chrono::Duration::minutes(10));

        let stored = f.service.session(&init.session_id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Initialized);
        assert_eq!(stored.ticket_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_cart_is_refused() {
        let f = fixture();
        let err = f
            .service
            .initialize_session(&Cart::new(), EventId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Session(_)));
        assert!(f.repository.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let f = fixture();
        let missing = SessionId::new();

        let err = f.service.validate_buyer_info(&missing, &buyer()).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
        let err = f.service.create_payment_intent(&missing).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
        let err = f.service.get_session_status(&missing).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_status_flips_to_expired_after_deadline() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(300));
        let report = f.service.get_session_status(&init.session_id).await.unwrap();
        assert_eq!(report.time_remaining, Duration::from_secs(300));
        assert!(!report.is_expired);

        f.clock.advance(chrono::Duration::seconds(301));
        let report = f.service.get_session_status(&init.session_id).await.unwrap();
        assert!(report.is_expired);
        assert_eq!(report.status, SessionStatus::Expired);
        assert_eq!(report.time_remaining, Duration::ZERO);

        // Stays expired even if the clock is wound back
        f.clock.set(test_time());
        let report = f.service.get_session_status(&init.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Expired);

        let err = f.service.apply_promo_code(&init.session_id, "WELCOME").await.unwrap_err();
        assert!(matches!(err, CheckoutError::Expired { .. }));
    }

    #[tokio::test]
    async fn test_invalid_buyer_info_keeps_status() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();

        let mut form = buyer();
        form.email = "nope".to_string();
        let err = f.service.validate_buyer_info(&init.session_id, &form).await.unwrap_err();
        let CheckoutError::Validation(fields) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(fields.has("email"));

        let stored = f.service.session(&init.session_id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Initialized);
        assert!(stored.buyer_info.is_none());
    }

    #[tokio::test]
    async fn test_payment_intent_requires_buyer_info() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let err = f.service.create_payment_intent(&init.session_id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Session(_)));
    }

    #[tokio::test]
    async fn test_full_payment_with_promo() {
        let f = fixture();
        let event_id = EventId::new();
        let init = f.service.initialize_session(&cart(), event_id).await.unwrap();
        let id = init.session_id;

        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();
        let promo = f.service.apply_promo_code(&id, "welcome").await.unwrap();
        assert!(promo.is_valid);
        assert_eq!(promo.total_after_discount, Money::from_cents(11645));

        let handle = f.service.create_payment_intent(&id).await.unwrap();
        assert_eq!(handle.amount, Money::from_cents(11645));
        assert_eq!(
            f.service.session(&id).await.unwrap().status,
            SessionStatus::PaymentIntentCreated
        );

        let order = f
            .service
            .pay(&id, &handle.payment_intent_id, &card(test_cards::SUCCESS))
            .await
            .unwrap();
        assert_eq!(order.event_id, event_id);
        assert_eq!(order.subtotal, Money::from_cents(13700));
        assert_eq!(order.total_amount, Money::from_cents(11645));
        assert_eq!(order.discount.percent(), 15);
        assert_eq!(order.tickets.len(), 2);
        assert_eq!(order.tickets[0].quantity, 2);
        assert_eq!(order.buyer_info.email, "ada@example.com");

        let stored = f.service.session(&id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::PaymentSucceeded);
        assert_eq!(
            stored.payment_intent.unwrap().status,
            PaymentIntentStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_promo_after_intent_invalidates_intent() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();
        let full_price = f.service.create_payment_intent(&id).await.unwrap();

        f.service.apply_promo_code(&id, "PROMO2025").await.unwrap();
        let stored = f.service.session(&id).await.unwrap();
        assert!(stored.payment_intent.is_none());
        assert_eq!(stored.status, SessionStatus::BuyerInfoValidated);

        let err = f
            .service
            .pay(&id, &full_price.payment_intent_id, &card(test_cards::SUCCESS))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Payment(PaymentGatewayError::UnknownIntent { .. })
        ));

        let discounted = f.service.create_payment_intent(&id).await.unwrap();
        assert_eq!(discounted.amount, Money::from_cents(12330));
    }

    #[tokio::test]
    async fn test_same_promo_twice_is_idempotent() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let first = f.service.apply_promo_code(&init.session_id, "WELCOME").await.unwrap();
        let second = f.service.apply_promo_code(&init.session_id, " Welcome ").await.unwrap();
        assert_eq!(first, second);

        let invalid = f.service.apply_promo_code(&init.session_id, "RANDOM123").await.unwrap();
        assert!(!invalid.is_valid);
        // An invalid code leaves the earlier discount in place
        assert_eq!(
            f.service.session(&init.session_id).await.unwrap().discount.percent(),
            15
        );
    }

    #[tokio::test]
    async fn test_declined_card_keeps_session_payable() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();
        let handle = f.service.create_payment_intent(&id).await.unwrap();

        let err = f
            .service
            .pay(&id, &handle.payment_intent_id, &card(test_cards::DECLINED))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Payment(PaymentGatewayError::CardDeclined { .. })
        ));
        assert_eq!(
            f.service.session(&id).await.unwrap().status,
            SessionStatus::PaymentIntentCreated
        );

        let order = f
            .service
            .pay(&id, &handle.payment_intent_id, &card(test_cards::SUCCESS))
            .await;
        assert!(order.is_ok());
    }

    #[tokio::test]
    async fn test_transient_gateway_failures_are_retried() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();

        f.gateway.fail_next_requests(2);
        assert!(f.service.create_payment_intent(&id).await.is_ok());

        f.gateway.fail_next_requests(3);
        let err = f.service.create_payment_intent(&id).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_intent_mismatch_is_payment_error() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();
        f.service.create_payment_intent(&id).await.unwrap();

        let err = f
            .service
            .confirm_payment_success(&id, &PaymentIntentId::new("pi_other"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Payment(_)));
    }

    #[tokio::test]
    async fn test_bad_card_is_rejected_before_gateway() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        f.service.validate_buyer_info(&id, &buyer()).await.unwrap();
        let handle = f.service.create_payment_intent(&id).await.unwrap();

        let mut bad = card(test_cards::SUCCESS);
        bad.cvc = "1".to_string();
        let err = f.service.pay(&id, &handle.payment_intent_id, &bad).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));
    }

    #[tokio::test]
    async fn test_clear_session_makes_id_unresolvable() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();

        assert!(f.service.clear_session(&init.session_id).await.unwrap());
        assert!(!f.service.clear_session(&init.session_id).await.unwrap());
        let err = f.service.get_session_status(&init.session_id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        let id = init.session_id;
        let service = Arc::new(f.service);

        let promo = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.apply_promo_code(&id, "WELCOME").await })
        };
        let buyer_task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.validate_buyer_info(&id, &buyer()).await })
        };
        promo.await.unwrap().unwrap();
        buyer_task.await.unwrap().unwrap();

        let stored = service.session(&id).await.unwrap();
        assert_eq!(stored.discount.percent(), 15);
        assert!(stored.buyer_info.is_some());
        assert_eq!(service.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_outlive_operations() {
        let f = fixture();
        for _ in 0..5 {
            let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
            f.service.validate_buyer_info(&init.session_id, &buyer()).await.unwrap();
            f.service.get_session_status(&init.session_id).await.unwrap();
        }
        f.clock.advance(chrono::Duration::minutes(11));
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));
        let err = f.service.apply_promo_code(&init.session_id, "WELCOME").await.unwrap_err();
        assert!(matches!(err, CheckoutError::Expired { .. }));

        assert_eq!(f.service.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_purge_drops_sessions_past_deadline_and_grace() {
        let f = fixture();
        let stale = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(8));
        let recent = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(12));

        // Both are past their deadline; only the first is past the grace
        let grace = chrono::Duration::minutes(5);
        assert_eq!(f.service.purge_expired(grace).await.unwrap(), 1);

        let err = f.service.get_session_status(&stale.session_id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
        let report = f.service.get_session_status(&recent.session_id).await.unwrap();
        assert!(report.is_expired);
        assert_eq!(f.repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_purge_task_sweeps_in_the_background() {
        let f = fixture();
        f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        let service = Arc::new(f.service);
        let sweeper =
            Arc::clone(&service).spawn_purge_task(Duration::from_millis(10), chrono::Duration::zero());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f.repository.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_paid_sessions_survive_purge() {
        let f = fixture();
        let init = f.service.initialize_session(&cart(), EventId::new()).await.unwrap();
        f.service.validate_buyer_info(&init.session_id, &buyer()).await.unwrap();
        let intent = f.service.create_payment_intent(&init.session_id).await.unwrap();
        f.service
            .pay(&init.session_id, &intent.payment_intent_id, &card(test_cards::SUCCESS))
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::hours(2));

        assert_eq!(f.service.purge_expired(chrono::Duration::zero()).await.unwrap(), 0);
        assert!(f.service.session(&init.session_id).await.is_ok());
    }
}
