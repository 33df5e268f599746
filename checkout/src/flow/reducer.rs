//! Reducer for the checkout flow.

use crate::cart::Cart;
use crate::error::{CartError, Result as CheckoutResult};
use crate::flow::{
    ActiveSession, CheckoutEnvironment, CheckoutFlowState, CheckoutStep, FlowAction, FlowError,
    FlowErrorKind, PendingRequest,
};
use crate::timer::{ExpiryTimer, TimerOutcome};
use crate::types::{CardDetails, OrderSummary, PaymentIntentId, SessionId, Ticket, TicketId};
use crate::validation;
use boxoffice_core::{
    CancellationToken, DateTime, SmallVec, Utc, effect::Effect, reducer::Reducer, smallvec,
};
use std::future::Future;
use std::sync::Arc;

type Effects = SmallVec<[Effect<FlowAction>; 4]>;

/// Reducer moving a buyer through ticket selection, buyer details and
/// payment.
///
/// Session calls run as effects under the state's cancellation token and
/// report back with the epoch they started in. A cancel, reset or expiry
/// moves to a new epoch, so a late result cannot bring an abandoned
/// checkout back.
///
/// Commands arriving while a request is in flight are ignored, except
/// [`FlowAction::CancelBooking`] and [`FlowAction::DismissError`].
#[derive(Clone, Debug, Default)]
pub struct CheckoutFlowReducer;

impl CheckoutFlowReducer {
    /// Create a new checkout flow reducer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// True if a command may run: right step and nothing in flight
    fn accepts(state: &CheckoutFlowState, steps: &[CheckoutStep], command: &'static str) -> bool {
        if !steps.contains(&state.step) {
            tracing::debug!(step = %state.step, command, "Command not available on this step");
            return false;
        }
        if let Some(pending) = state.pending {
            tracing::debug!(?pending, command, "Command ignored while a request is in flight");
            return false;
        }
        true
    }

    fn is_stale(state: &CheckoutFlowState, epoch: u64, result: &'static str) -> bool {
        let stale = epoch != state.epoch;
        if stale {
            tracing::debug!(epoch, current = state.epoch, result, "Dropping result of an abandoned request");
        }
        stale
    }

    /// Runs a session call under the state's token, feeding its outcome back
    /// as an action
    fn request<T, Fut, F>(state: &CheckoutFlowState, work: Fut, on_success: F) -> Effect<FlowAction>
    where
        Fut: Future<Output = CheckoutResult<T>> + Send + 'static,
        F: FnOnce(u64, T) -> FlowAction + Send + 'static,
    {
        Self::outcome(state, work, on_success).cancellable(state.token.clone())
    }

    /// Like [`Self::request`] but always reports back, even after the
    /// epoch moved on
    fn outcome<T, Fut, F>(state: &CheckoutFlowState, work: Fut, on_success: F) -> Effect<FlowAction>
    where
        Fut: Future<Output = CheckoutResult<T>> + Send + 'static,
        F: FnOnce(u64, T) -> FlowAction + Send + 'static,
    {
        let epoch = state.epoch;
        Effect::future(async move {
            let action = match work.await {
                Ok(value) => on_success(epoch, value),
                Err(err) => {
                    tracing::warn!(epoch, error = %err, "Checkout request failed");
                    FlowAction::RequestFailed {
                        epoch,
                        error: FlowError::from(&err),
                    }
                },
            };
            Some(action)
        })
    }

    /// Charges the card under the state's token
    ///
    /// A payment dropped mid-flight, or one that completes after its
    /// checkout was abandoned, is logged for reconciliation.
    fn payment(
        state: &CheckoutFlowState,
        env: &CheckoutEnvironment,
        session_id: SessionId,
        payment_intent_id: PaymentIntentId,
        card: CardDetails,
    ) -> Effect<FlowAction> {
        let sessions = Arc::clone(&env.sessions);
        let token = state.token.clone();
        Self::request(
            state,
            async move {
                let watch = PaymentWatch {
                    session_id,
                    payment_intent_id,
                    token,
                    settled: false,
                };
                let result = sessions.pay(&session_id, &watch.payment_intent_id, &card).await;
                watch.settle(result.as_ref().ok());
                result
            },
            |epoch, order| FlowAction::PaymentSucceeded { epoch, order },
        )
    }

    /// Countdown to the session deadline
    fn deadline(
        state: &CheckoutFlowState,
        env: &CheckoutEnvironment,
        expires_at: DateTime<Utc>,
    ) -> Effect<FlowAction> {
        let timer = ExpiryTimer::new(expires_at, Arc::clone(&env.clock), env.tick)
            .with_cancellation(state.token.clone());
        let epoch = state.epoch;
        Effect::future(async move {
            match timer.run().await {
                TimerOutcome::Expired => Some(FlowAction::DeadlineReached { epoch }),
                TimerOutcome::Cancelled => None,
            }
        })
        .cancellable(state.token.clone())
    }

    /// Deletes a session; outlives the epoch that started it
    fn clear_session(env: &CheckoutEnvironment, session_id: SessionId) -> Effect<FlowAction> {
        let sessions = Arc::clone(&env.sessions);
        Effect::future(async move {
            if let Err(error) = sessions.clear_session(&session_id).await {
                tracing::warn!(%session_id, %error, "Failed to clear checkout session");
            }
            None
        })
    }

    /// Marks a session expired; outlives the epoch that started it
    fn expire_session(env: &CheckoutEnvironment, session_id: SessionId) -> Effect<FlowAction> {
        let sessions = Arc::clone(&env.sessions);
        Effect::future(async move {
            if let Err(error) = sessions.expire_session(&session_id).await {
                tracing::warn!(%session_id, %error, "Failed to expire checkout session");
            }
            None
        })
    }

    /// Applies a cart change, keeping the old cart if it fails
    fn update_cart<F>(state: &mut CheckoutFlowState, change: F) -> Effects
    where
        F: FnOnce(&mut Cart) -> Result<(), CartError>,
    {
        let mut cart = state.cart.clone();
        match change(&mut cart).and_then(|()| cart.total()) {
            Ok(total) => {
                state.cart = cart;
                state.total = total;
                state.error = None;
                tracing::debug!(
                    lines = state.cart.len(),
                    items = state.cart.item_count(),
                    total = %total,
                    "Cart updated"
                );
            },
            Err(err) => {
                tracing::debug!(error = %err, "Cart change rejected");
                state.error = Some(FlowError::from(&err));
            },
        }
        SmallVec::new()
    }

    fn create_intent(state: &mut CheckoutFlowState, env: &CheckoutEnvironment) -> Effects {
        let Some(session_id) = state.session_id() else {
            return SmallVec::new();
        };
        state.pending = Some(PendingRequest::CreatingIntent);
        let sessions = Arc::clone(&env.sessions);
        smallvec![Self::request(
            state,
            async move { sessions.create_payment_intent(&session_id).await },
            |epoch, intent| FlowAction::PaymentIntentCreated { epoch, intent },
        )]
    }

    /// Moves to the expired screen, keeping only the session id so the
    /// session can be cleared on the way out
    fn expire(state: &mut CheckoutFlowState, env: &CheckoutEnvironment) -> Effects {
        let Some(session) = state.session.take() else {
            return SmallVec::new();
        };
        let session_id = session.id;

        state.invalidate();
        state.clear_checkout();
        state.session = Some(session);
        state.step = CheckoutStep::Expired;

        tracing::info!(%session_id, "Checkout expired");
        smallvec![Self::expire_session(env, session_id)]
    }

    fn ticket_or_error(state: &mut CheckoutFlowState, ticket_id: TicketId) -> Option<Ticket> {
        let ticket = state.ticket(&ticket_id).cloned();
        if ticket.is_none() {
            state.error = Some(FlowError::from(&CartError::UnknownTicket { ticket_id }));
        }
        ticket
    }
}

impl Reducer for CheckoutFlowReducer {
    type State = CheckoutFlowState;
    type Action = FlowAction;
    type Environment = CheckoutEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per action
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Ticket selection ==========
            FlowAction::OpenTicketSelection { event_id, catalog } => {
                if !matches!(
                    state.step,
                    CheckoutStep::Idle | CheckoutStep::TicketSelection | CheckoutStep::Completed
                ) {
                    tracing::debug!(step = %state.step, "Ticket selection not available on this step");
                    return SmallVec::new();
                }

                if state.step == CheckoutStep::Completed || state.event_id != Some(event_id) {
                    state.reset_to_selection();
                }
                state.step = CheckoutStep::TicketSelection;
                state.event_id = Some(event_id);
                state.catalog = catalog;

                tracing::info!(%event_id, tickets = state.catalog.len(), "Ticket selection opened");
                SmallVec::new()
            },

            FlowAction::AddToCart { ticket_id } => {
                if !Self::accepts(state, &[CheckoutStep::TicketSelection], "add_to_cart") {
                    return SmallVec::new();
                }
                let Some(ticket) = Self::ticket_or_error(state, ticket_id) else {
                    return SmallVec::new();
                };
                Self::update_cart(state, |cart| cart.add_to_cart(ticket))
            },

            FlowAction::ChangeQuantity {
                ticket_id,
                quantity,
            } => {
                if !Self::accepts(state, &[CheckoutStep::TicketSelection], "change_quantity") {
                    return SmallVec::new();
                }
                Self::update_cart(state, |cart| cart.change_quantity(&ticket_id, quantity))
            },

            FlowAction::RemoveFromCart { ticket_id } => {
                if !Self::accepts(state, &[CheckoutStep::TicketSelection], "remove_from_cart") {
                    return SmallVec::new();
                }
                Self::update_cart(state, |cart| {
                    cart.remove_from_cart(&ticket_id);
                    Ok(())
                })
            },

            FlowAction::ProceedToCheckout => {
                if !Self::accepts(state, &[CheckoutStep::TicketSelection], "proceed_to_checkout") {
                    return SmallVec::new();
                }
                let Some(event_id) = state.event_id else {
                    return SmallVec::new();
                };
                if state.cart.is_empty() {
                    state.error = Some(FlowError::new(
                        FlowErrorKind::Cart,
                        "Select at least one ticket to continue",
                    ));
                    return SmallVec::new();
                }

                state.pending = Some(PendingRequest::StartingSession);
                state.error = None;
                let sessions = Arc::clone(&env.sessions);
                let cart = state.cart.clone();
                // A session created after a cancel must still come back to be deleted
                smallvec![Self::outcome(
                    state,
                    async move { sessions.initialize_session(&cart, event_id).await },
                    |epoch, init| FlowAction::SessionInitialized { epoch, init },
                )]
            },

            FlowAction::SessionInitialized { epoch, init } => {
                if Self::is_stale(state, epoch, "session_initialized") {
                    // Nobody will ever use it
                    return smallvec![Self::clear_session(env, init.session_id)];
                }

                state.pending = None;
                state.total = init.total_amount;
                state.step = CheckoutStep::BuyerInfo;
                state.session = Some(ActiveSession {
                    id: init.session_id,
                    expires_at: init.expires_at,
                    total_amount: init.total_amount,
                });

                tracing::info!(
                    session_id = %init.session_id,
                    expires_at = %init.expires_at,
                    total = %init.total_amount,
                    "Checkout started"
                );
                smallvec![Self::deadline(state, env, init.expires_at)]
            },

            // ========== Buyer details ==========
            FlowAction::SubmitBuyerInfo { form } => {
                if !Self::accepts(state, &[CheckoutStep::BuyerInfo], "submit_buyer_info") {
                    return SmallVec::new();
                }
                let Some(session_id) = state.session_id() else {
                    return SmallVec::new();
                };
                if let Err(fields) = validation::validate_buyer_info(&form) {
                    tracing::debug!(fields = %fields, "Buyer info rejected locally");
                    state.error = Some(FlowError::validation(fields));
                    return SmallVec::new();
                }

                state.pending = Some(PendingRequest::ValidatingBuyer);
                state.error = None;
                let sessions = Arc::clone(&env.sessions);
                smallvec![Self::request(
                    state,
                    async move { sessions.validate_buyer_info(&session_id, &form).await },
                    |epoch, buyer_info| FlowAction::BuyerInfoValidated { epoch, buyer_info },
                )]
            },

            FlowAction::BuyerInfoValidated { epoch, buyer_info } => {
                if Self::is_stale(state, epoch, "buyer_info_validated") {
                    return SmallVec::new();
                }

                state.pending = None;
                state.buyer_info = Some(buyer_info);
                state.payment_intent = None;
                state.step = CheckoutStep::PaymentInfo;
                tracing::info!(session_id = ?state.session_id(), "Buyer info accepted");

                Self::create_intent(state, env)
            },

            FlowAction::ApplyPromoCode { code } => {
                if !Self::accepts(
                    state,
                    &[CheckoutStep::BuyerInfo, CheckoutStep::PaymentInfo],
                    "apply_promo_code",
                ) {
                    return SmallVec::new();
                }
                let Some(session_id) = state.session_id() else {
                    return SmallVec::new();
                };

                state.pending = Some(PendingRequest::ApplyingPromo);
                let sessions = Arc::clone(&env.sessions);
                smallvec![Self::request(
                    state,
                    async move { sessions.apply_promo_code(&session_id, &code).await },
                    |epoch, result| FlowAction::PromoCodeApplied { epoch, result },
                )]
            },

            FlowAction::PromoCodeApplied { epoch, result } => {
                if Self::is_stale(state, epoch, "promo_code_applied") {
                    return SmallVec::new();
                }
                state.pending = None;

                let reprice = result.is_valid && state.discount != result.discount;
                if result.is_valid {
                    state.discount = result.discount;
                }
                state.promo = Some(result);

                // The service dropped the intent priced without the new discount
                if reprice && state.payment_intent.take().is_some() {
                    tracing::debug!(discount = state.discount.percent(), "Repricing payment");
                    if state.step == CheckoutStep::PaymentInfo {
                        return Self::create_intent(state, env);
                    }
                }
                SmallVec::new()
            },

            // ========== Payment ==========
            FlowAction::PaymentIntentCreated { epoch, intent } => {
                if Self::is_stale(state, epoch, "payment_intent_created") {
                    return SmallVec::new();
                }
                state.pending = None;
                tracing::debug!(
                    payment_intent_id = %intent.payment_intent_id,
                    amount = %intent.amount,
                    "Payment ready"
                );
                state.payment_intent = Some(intent);
                SmallVec::new()
            },

            FlowAction::PreparePayment => {
                if !Self::accepts(state, &[CheckoutStep::PaymentInfo], "prepare_payment")
                    || state.payment_intent.is_some()
                {
                    return SmallVec::new();
                }
                state.error = None;
                Self::create_intent(state, env)
            },

            FlowAction::Back => {
                if !Self::accepts(state, &[CheckoutStep::PaymentInfo], "back") {
                    return SmallVec::new();
                }
                state.step = CheckoutStep::BuyerInfo;
                state.payment_intent = None;
                state.error = None;
                tracing::debug!(total = %state.total, discount = state.discount.percent(), "Back to buyer info");
                SmallVec::new()
            },

            FlowAction::SubmitPayment { card } => {
                if !Self::accepts(state, &[CheckoutStep::PaymentInfo], "submit_payment") {
                    return SmallVec::new();
                }
                let (Some(session_id), Some(intent)) = (state.session_id(), state.payment_intent.as_ref())
                else {
                    state.error = Some(FlowError::new(
                        FlowErrorKind::Payment,
                        "Payment is not ready yet",
                    ));
                    return SmallVec::new();
                };
                let intent_id = intent.payment_intent_id.clone();

                if let Err(fields) = validation::validate_card(&card, env.clock().now()) {
                    tracing::debug!(fields = %fields, "Card rejected locally");
                    state.error = Some(FlowError::validation(fields));
                    return SmallVec::new();
                }

                state.pending = Some(PendingRequest::Paying);
                state.error = None;
                smallvec![Self::payment(state, env, session_id, intent_id, card)]
            },

            FlowAction::PaymentSucceeded { epoch, order } => {
                if Self::is_stale(state, epoch, "payment_succeeded") {
                    return SmallVec::new();
                }

                let session_id = state.session_id();
                state.invalidate();
                state.clear_checkout();
                tracing::info!(order_id = %order.order_id, total = %order.total_amount, "Checkout completed");
                state.order = Some(order);
                state.step = CheckoutStep::Completed;

                session_id
                    .map(|id| Self::clear_session(env, id))
                    .into_iter()
                    .collect()
            },

            // ========== Failures and exits ==========
            FlowAction::RequestFailed { epoch, error } => {
                if Self::is_stale(state, epoch, "request_failed") {
                    return SmallVec::new();
                }
                state.pending = None;

                match error.kind {
                    FlowErrorKind::Expired => Self::expire(state, env),
                    FlowErrorKind::NotFound => {
                        tracing::warn!(step = %state.step, "Checkout session lost, starting over");
                        state.reset_to_selection();
                        state.error = Some(error);
                        SmallVec::new()
                    },
                    _ => {
                        state.error = Some(error);
                        SmallVec::new()
                    },
                }
            },

            FlowAction::DeadlineReached { epoch } => {
                if Self::is_stale(state, epoch, "deadline_reached") {
                    return SmallVec::new();
                }
                let now = env.clock().now();
                match state.session.as_ref().map(|session| session.expires_at) {
                    Some(expires_at) if now >= expires_at => Self::expire(state, env),
                    Some(expires_at) => {
                        tracing::debug!(%expires_at, %now, "Deadline not reached yet");
                        SmallVec::new()
                    },
                    None => SmallVec::new(),
                }
            },

            FlowAction::CancelBooking => {
                if !matches!(
                    state.step,
                    CheckoutStep::TicketSelection | CheckoutStep::BuyerInfo | CheckoutStep::PaymentInfo
                ) {
                    tracing::debug!(step = %state.step, "Nothing to cancel");
                    return SmallVec::new();
                }

                let session_id = state.session_id();
                state.reset_to_selection();
                tracing::info!(session_id = ?session_id, "Booking cancelled");

                session_id
                    .map(|id| Self::clear_session(env, id))
                    .into_iter()
                    .collect()
            },

            FlowAction::ReturnToEvent => {
                if !matches!(state.step, CheckoutStep::Expired | CheckoutStep::Completed) {
                    tracing::debug!(step = %state.step, "Return to event not available on this step");
                    return SmallVec::new();
                }

                let session_id = state.session_id();
                state.reset_to_selection();

                session_id
                    .map(|id| Self::clear_session(env, id))
                    .into_iter()
                    .collect()
            },

            FlowAction::DismissError => {
                state.error = None;
                SmallVec::new()
            },
        }
    }
}

/// Tracks one payment effect until it settles
struct PaymentWatch {
    session_id: SessionId,
    payment_intent_id: PaymentIntentId,
    token: CancellationToken,
    settled: bool,
}

impl PaymentWatch {
    fn settle(mut self, order: Option<&OrderSummary>) {
        self.settled = true;
        if let Some(order) = order.filter(|_| self.token.is_cancelled()) {
            tracing::error!(
                order_id = %order.order_id,
                session_id = %self.session_id,
                payment_intent_id = %self.payment_intent_id,
                "Payment captured for an abandoned checkout"
            );
        }
    }
}

impl Drop for PaymentWatch {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                session_id = %self.session_id,
                payment_intent_id = %self.payment_intent_id,
                "Payment abandoned while the gateway was answering"
            );
        }
    }
}
