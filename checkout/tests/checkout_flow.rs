//! Integration tests for the checkout flow running on a Store
//!
//! Effects really run here: sessions are stored in memory, the mock gateway
//! charges test cards and the countdown ticks against a manual clock.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_checkout::flow::{
    CheckoutEnvironment, CheckoutStep, CheckoutStore, FlowAction, FlowErrorKind, checkout_store,
};
use boxoffice_checkout::payment_gateway::{MockPaymentGateway, test_cards};
use boxoffice_checkout::repository::InMemorySessionRepository;
use boxoffice_checkout::session::{SessionService, SessionSettings};
use boxoffice_checkout::types::{
    BuyerInfoForm, CardDetails, Currency, EventId, Money, PaymentIntentStatus, SessionStatus,
    Ticket, TicketId,
};
use boxoffice_checkout::CheckoutError;
use boxoffice_runtime::retry::RetryPolicy;
use boxoffice_testing::{ManualClock, test_time};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: CheckoutStore,
    clock: ManualClock,
    gateway: MockPaymentGateway,
    repository: Arc<InMemorySessionRepository>,
    sessions: Arc<SessionService>,
}

fn harness() -> Harness {
    harness_with_gateway(MockPaymentGateway::new())
}

fn harness_with_gateway(gateway: MockPaymentGateway) -> Harness {
    harness_with(gateway, Duration::ZERO)
}

fn harness_with(gateway: MockPaymentGateway, latency: Duration) -> Harness {
    let clock = ManualClock::at(test_time());
    let repository = Arc::new(InMemorySessionRepository::new());
    let sessions = Arc::new(
        SessionService::new(
            repository.clone(),
            Arc::new(gateway.clone()),
            Arc::new(clock.clone()),
        )
        .with_settings(SessionSettings {
            latency,
            retry: RetryPolicy::none(),
            ..SessionSettings::default()
        }),
    );
    let env = CheckoutEnvironment::new(Arc::clone(&sessions), Arc::new(clock.clone()))
        .with_tick(Duration::from_millis(10));

    Harness {
        store: checkout_store(env),
        clock,
        gateway,
        repository,
        sessions,
    }
}

fn catalog() -> Vec<Ticket> {
    vec![
        Ticket::new(1u32, "General Admission", Money::from_cents(2900), Currency::usd(), 100),
        Ticket::new(3u32, "VIP", Money::from_cents(7900), Currency::usd(), 10),
    ]
}

fn buyer() -> BuyerInfoForm {
    BuyerInfoForm {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        email: "Ada@Example.com".to_string(),
        phone: "+1 (555) 123-4567".to_string(),
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

/// Sends `action` and waits for the first produced action matching `done`
async fn step<F>(store: &CheckoutStore, action: FlowAction, done: F) -> FlowAction
where
    F: Fn(&FlowAction) -> bool,
{
    store
        .send_and_wait_for(action, done, WAIT)
        .await
        .expect("flow did not produce the expected action")
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<FlowAction>, matches: F) -> FlowAction
where
    F: Fn(&FlowAction) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(action) if matches(&action) => return action,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => panic!("action channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for action")
}

/// Ticket selection with 2 × General Admission and 1 × VIP (137.00)
async fn fill_cart(store: &CheckoutStore) {
    store
        .send(FlowAction::OpenTicketSelection {
            event_id: EventId::new(),
            catalog: catalog(),
        })
        .await
        .unwrap();
    store.send(FlowAction::AddToCart { ticket_id: TicketId::from(1u32) }).await.unwrap();
    store.send(FlowAction::AddToCart { ticket_id: TicketId::from(3u32) }).await.unwrap();
    store
        .send(FlowAction::ChangeQuantity {
            ticket_id: TicketId::from(1u32),
            quantity: 2,
        })
        .await
        .unwrap();
}

async fn reach_buyer_info(store: &CheckoutStore) {
    fill_cart(store).await;
    step(store, FlowAction::ProceedToCheckout, |a| {
        matches!(a, FlowAction::SessionInitialized { .. })
    })
    .await;
}

async fn reach_payment(store: &CheckoutStore) {
    reach_buyer_info(store).await;
    step(store, FlowAction::SubmitBuyerInfo { form: buyer() }, |a| {
        matches!(a, FlowAction::PaymentIntentCreated { .. })
    })
    .await;
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_checkout_with_promo_code() {
    let h = harness();
    fill_cart(&h.store).await;
    assert_eq!(h.store.state(|s| s.total).await, Money::from_cents(13700));

    step(&h.store, FlowAction::ProceedToCheckout, |a| {
        matches!(a, FlowAction::SessionInitialized { .. })
    })
    .await;
    let (step_now, countdown) = h
        .store
        .state(|s| (s.step, s.countdown(test_time())))
        .await;
    assert_eq!(step_now, CheckoutStep::BuyerInfo);
    assert_eq!(countdown.unwrap().to_string(), "10:00");

    step(
        &h.store,
        FlowAction::ApplyPromoCode {
            code: " welcome ".to_string(),
        },
        |a| matches!(a, FlowAction::PromoCodeApplied { .. }),
    )
    .await;

    step(&h.store, FlowAction::SubmitBuyerInfo { form: buyer() }, |a| {
        matches!(a, FlowAction::PaymentIntentCreated { .. })
    })
    .await;
    let intent = h.store.state(|s| s.payment_intent.clone()).await.unwrap();
    assert_eq!(intent.amount, Money::from_cents(11645));

    step(
        &h.store,
        FlowAction::SubmitPayment {
            card: card(test_cards::SUCCESS),
        },
        |a| matches!(a, FlowAction::PaymentSucceeded { .. }),
    )
    .await;

    let (step_now, order) = h.store.state(|s| (s.step, s.order.clone())).await;
    assert_eq!(step_now, CheckoutStep::Completed);
    let order = order.unwrap();
    assert_eq!(order.subtotal, Money::from_cents(13700));
    assert_eq!(order.total_amount, Money::from_cents(11645));
    assert_eq!(order.discount.percent(), 15);
    assert_eq!(order.buyer_info.email, "ada@example.com");
    assert_eq!(order.buyer_info.phone.e164, "+15551234567");
    assert_eq!(
        h.gateway.intent(&intent.payment_intent_id).unwrap().status,
        PaymentIntentStatus::Succeeded
    );

    // Countdown stopped and the session was deleted
    h.store.settle(WAIT).await.unwrap();
    assert!(h.repository.is_empty().await);
}

#[tokio::test]
async fn test_back_preserves_cart_and_discount() {
    let h = harness();
    reach_buyer_info(&h.store).await;
    step(
        &h.store,
        FlowAction::ApplyPromoCode {
            code: "PROMO2025".to_string(),
        },
        |a| matches!(a, FlowAction::PromoCodeApplied { .. }),
    )
    .await;
    step(&h.store, FlowAction::SubmitBuyerInfo { form: buyer() }, |a| {
        matches!(a, FlowAction::PaymentIntentCreated { .. })
    })
    .await;

    let before = h.store.state(|s| (s.total, s.discount, s.cart.clone())).await;
    h.store.send(FlowAction::Back).await.unwrap();

    let (step_now, total, discount, cart, intent) = h
        .store
        .state(|s| (s.step, s.total, s.discount, s.cart.clone(), s.payment_intent.clone()))
        .await;
    assert_eq!(step_now, CheckoutStep::BuyerInfo);
    assert_eq!((total, discount, cart), before);
    assert_eq!(total, Money::from_cents(13700));
    assert_eq!(discount.percent(), 10);
    assert!(intent.is_none());

    // Forward again gets a payment intent for the discounted total
    step(&h.store, FlowAction::SubmitBuyerInfo { form: buyer() }, |a| {
        matches!(a, FlowAction::PaymentIntentCreated { .. })
    })
    .await;
    let intent = h.store.state(|s| s.payment_intent.clone()).await.unwrap();
    assert_eq!(intent.amount, Money::from_cents(12330));
}

#[tokio::test]
async fn test_declined_card_can_be_retried() {
    let h = harness();
    reach_payment(&h.store).await;

    let failed = step(
        &h.store,
        FlowAction::SubmitPayment {
            card: card(test_cards::DECLINED),
        },
        |a| matches!(a, FlowAction::RequestFailed { .. }),
    )
    .await;
    let FlowAction::RequestFailed { error, .. } = failed else {
        panic!("expected a failure, got {failed:?}");
    };
    assert_eq!(error.kind, FlowErrorKind::Payment);

    let (step_now, buyer_kept) = h
        .store
        .state(|s| (s.step, s.buyer_info.is_some()))
        .await;
    assert_eq!(step_now, CheckoutStep::PaymentInfo);
    assert!(buyer_kept);

    h.store.send(FlowAction::DismissError).await.unwrap();
    step(
        &h.store,
        FlowAction::SubmitPayment {
            card: card(test_cards::SUCCESS),
        },
        |a| matches!(a, FlowAction::PaymentSucceeded { .. }),
    )
    .await;
    assert_eq!(h.store.state(|s| s.step).await, CheckoutStep::Completed);
}

#[tokio::test]
async fn test_cancel_booking_leaves_no_session_behind() {
    let h = harness();
    reach_buyer_info(&h.store).await;
    let session_id = h.store.state(|s| s.session_id()).await.unwrap();

    h.store.send(FlowAction::CancelBooking).await.unwrap();
    h.store.settle(WAIT).await.unwrap();

    let (step_now, empty, total, session) = h
        .store
        .state(|s| (s.step, s.cart.is_empty(), s.total, s.session.clone()))
        .await;
    assert_eq!(step_now, CheckoutStep::TicketSelection);
    assert!(empty);
    assert_eq!(total, Money::ZERO);
    assert!(session.is_none());

    let err = h.sessions.get_session_status(&session_id).await.unwrap_err();
    assert!(matches!(err, CheckoutError::NotFound { .. }));
}

#[tokio::test]
async fn test_cancel_while_starting_deletes_late_session() {
    let h = harness_with(MockPaymentGateway::new(), Duration::from_millis(100));
    fill_cart(&h.store).await;
    let mut rx = h.store.subscribe_actions();

    h.store.send(FlowAction::ProceedToCheckout).await.unwrap();
    h.store.send(FlowAction::CancelBooking).await.unwrap();

    next_matching(&mut rx, |a| matches!(a, FlowAction::SessionInitialized { .. })).await;
    h.store.settle(WAIT).await.unwrap();

    let (step_now, session) = h.store.state(|s| (s.step, s.session.clone())).await;
    assert_eq!(step_now, CheckoutStep::TicketSelection);
    assert!(session.is_none());
    assert!(h.repository.is_empty().await);
}

#[tokio::test]
async fn test_deadline_expires_checkout_and_return_resets() {
    let h = harness();
    reach_buyer_info(&h.store).await;
    let session_id = h.store.state(|s| s.session_id()).await.unwrap();
    let mut rx = h.store.subscribe_actions();

    h.clock.advance(chrono::Duration::seconds(601));
    next_matching(&mut rx, |a| matches!(a, FlowAction::DeadlineReached { .. })).await;
    h.store.settle(WAIT).await.unwrap();

    let (step_now, empty) = h.store.state(|s| (s.step, s.cart.is_empty())).await;
    assert_eq!(step_now, CheckoutStep::Expired);
    assert!(empty);

    let report = h.sessions.get_session_status(&session_id).await.unwrap();
    assert!(report.is_expired);
    assert_eq!(report.status, SessionStatus::Expired);

    // Nothing but "return to event" leaves the expired screen
    h.store.send(FlowAction::CancelBooking).await.unwrap();
    assert_eq!(h.store.state(|s| s.step).await, CheckoutStep::Expired);

    h.store.send(FlowAction::ReturnToEvent).await.unwrap();
    h.store.settle(WAIT).await.unwrap();
    assert_eq!(h.store.state(|s| s.step).await, CheckoutStep::TicketSelection);
    assert!(matches!(
        h.sessions.session(&session_id).await,
        Err(CheckoutError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_expiry_wins_over_in_flight_payment() {
    let h = harness_with_gateway(MockPaymentGateway::with_latency(Duration::from_millis(300)));
    reach_payment(&h.store).await;
    let intent = h.store.state(|s| s.payment_intent.clone()).await.unwrap();
    let session_id = h.store.state(|s| s.session_id()).await.unwrap();
    let mut rx = h.store.subscribe_actions();

    h.store
        .send(FlowAction::SubmitPayment {
            card: card(test_cards::SUCCESS),
        })
        .await
        .unwrap();
    // The deadline passes while the gateway is still answering
    tokio::time::timeout(WAIT, h.gateway.confirm_started()).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(11));

    next_matching(&mut rx, |a| matches!(a, FlowAction::DeadlineReached { .. })).await;
    h.store.settle(WAIT).await.unwrap();
    // Longer than the gateway latency
    tokio::time::sleep(Duration::from_millis(400)).await;

    let (step_now, order) = h.store.state(|s| (s.step, s.order.clone())).await;
    assert_eq!(step_now, CheckoutStep::Expired);
    assert!(order.is_none());

    // The abandoned charge never fed a result back
    while let Ok(action) = rx.try_recv() {
        assert!(
            !matches!(action, FlowAction::PaymentSucceeded { .. }),
            "late payment result resurrected the checkout"
        );
    }
    assert_ne!(
        h.gateway.intent(&intent.payment_intent_id).unwrap().status,
        PaymentIntentStatus::Succeeded
    );
    assert_eq!(
        h.sessions.session(&session_id).await.unwrap().status,
        SessionStatus::Expired
    );
}

#[tokio::test]
async fn test_commands_during_request_are_ignored() {
    let h = harness_with_gateway(MockPaymentGateway::with_latency(Duration::from_millis(100)));
    reach_payment(&h.store).await;
    let mut rx = h.store.subscribe_actions();

    h.store
        .send(FlowAction::SubmitPayment {
            card: card(test_cards::SUCCESS),
        })
        .await
        .unwrap();
    // Ignored: a payment is in flight
    h.store.send(FlowAction::Back).await.unwrap();
    assert_eq!(h.store.state(|s| s.step).await, CheckoutStep::PaymentInfo);

    next_matching(&mut rx, |a| matches!(a, FlowAction::PaymentSucceeded { .. })).await;
    assert_eq!(h.store.state(|s| s.step).await, CheckoutStep::Completed);
}
