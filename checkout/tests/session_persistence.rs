//! Integration tests for sessions stored in a JSON file
//!
//! Each test gets its own temp directory. Services built over the same path
//! share state the way two processes would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_checkout::flow::{CheckoutEnvironment, CheckoutStep, FlowAction, checkout_store};
use boxoffice_checkout::payment_gateway::{MockPaymentGateway, test_cards};
use boxoffice_checkout::repository::{FileSessionRepository, SessionRepository};
use boxoffice_checkout::session::SessionService;
use boxoffice_checkout::types::{
    BuyerInfoForm, CardDetails, Currency, EventId, Money, SessionStatus, Ticket, TicketId,
};
use boxoffice_checkout::{Cart, CheckoutError};
use boxoffice_testing::{ManualClock, test_time};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test Fixtures
// ============================================================================

fn service(path: &Path, gateway: &MockPaymentGateway, clock: &ManualClock) -> SessionService {
    SessionService::new(
        Arc::new(FileSessionRepository::new(path)),
        Arc::new(gateway.clone()),
        Arc::new(clock.clone()),
    )
}

fn catalog() -> Vec<Ticket> {
    vec![
        Ticket::new(1u32, "General Admission", Money::from_cents(2900), Currency::usd(), 100),
        Ticket::new(3u32, "VIP", Money::from_cents(7900), Currency::usd(), 10),
    ]
}

/// 2 × General Admission + 1 × VIP = 137.00
fn cart() -> Cart {
    let mut cart = Cart::new();
    for ticket in catalog() {
        cart.add_to_cart(ticket).unwrap();
    }
    cart.change_quantity(&TicketId::from(1u32), 2).unwrap();
    cart
}

fn buyer() -> BuyerInfoForm {
    BuyerInfoForm {
        first_name: "Grace".to_string(),
        last_name: "Hopper".to_string(),
        email: "grace@example.com".to_string(),
        phone: "+1 555 010 9999".to_string(),
    }
}

fn card() -> CardDetails {
    CardDetails {
        holder_name: "Grace Hopper".to_string(),
        number: test_cards::SUCCESS.to_string(),
        exp_month: 6,
        exp_year: 2031,
        cvc: "4242".to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_session_survives_service_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    let gateway = MockPaymentGateway::new();
    let clock = ManualClock::at(test_time());

    let session_id = {
        let first = service(&path, &gateway, &clock);
        let init = first.initialize_session(&cart(), EventId::new()).await.unwrap();
        first.validate_buyer_info(&init.session_id, &buyer()).await.unwrap();
        first.apply_promo_code(&init.session_id, "welcome").await.unwrap();
        init.session_id
    };

    let second = service(&path, &gateway, &clock);
    let stored = second.session(&session_id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::BuyerInfoValidated);
    assert_eq!(stored.discount.percent(), 15);
    assert_eq!(stored.promo_code.as_deref(), Some("WELCOME"));

    let intent = second.create_payment_intent(&session_id).await.unwrap();
    assert_eq!(intent.amount, Money::from_cents(11645));

    let order = second
        .pay(&session_id, &intent.payment_intent_id, &card())
        .await
        .unwrap();
    assert_eq!(order.total_amount, Money::from_cents(11645));
    assert_eq!(order.tickets.len(), 2);

    // Paid sessions never expire
    clock.advance(chrono::Duration::hours(1));
    let report = second.get_session_status(&session_id).await.unwrap();
    assert_eq!(report.status, SessionStatus::PaymentSucceeded);
    assert!(!report.is_expired);
}

#[tokio::test]
async fn test_expiry_is_written_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    let gateway = MockPaymentGateway::new();
    let clock = ManualClock::at(test_time());
    let sessions = service(&path, &gateway, &clock);

    let init = sessions.initialize_session(&cart(), EventId::new()).await.unwrap();

    clock.advance(chrono::Duration::seconds(599));
    let report = sessions.get_session_status(&init.session_id).await.unwrap();
    assert!(!report.is_expired);
    assert_eq!(report.time_remaining, Duration::from_secs(1));

    clock.advance(chrono::Duration::seconds(2));
    let report = sessions.get_session_status(&init.session_id).await.unwrap();
    assert!(report.is_expired);
    assert_eq!(report.status, SessionStatus::Expired);
    assert_eq!(report.time_remaining, Duration::ZERO);

    // Another reader of the file sees the expired status
    let stored = FileSessionRepository::new(&path)
        .get(&init.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);

    let err = sessions
        .validate_buyer_info(&init.session_id, &buyer())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::Expired { .. }));
    let err = sessions
        .apply_promo_code(&init.session_id, "WELCOME")
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::Expired { .. }));
}

#[tokio::test]
async fn test_unknown_code_keeps_earlier_discount() {
    let dir = TempDir::new().unwrap();
    let gateway = MockPaymentGateway::new();
    let clock = ManualClock::at(test_time());
    let sessions = service(&dir.path().join("sessions.json"), &gateway, &clock);
    let init = sessions.initialize_session(&cart(), EventId::new()).await.unwrap();

    let welcome = sessions.apply_promo_code(&init.session_id, "WELCOME").await.unwrap();
    assert!(welcome.is_valid);
    assert_eq!(welcome.total_after_discount, Money::from_cents(11645));

    let unknown = sessions
        .apply_promo_code(&init.session_id, "RANDOM123")
        .await
        .unwrap();
    assert!(!unknown.is_valid);
    assert_eq!(unknown.message, "Invalid promo code");
    assert_eq!(unknown.total_after_discount, Money::from_cents(13700));

    let stored = sessions.session(&init.session_id).await.unwrap();
    assert_eq!(stored.discount.percent(), 15);
    assert_eq!(stored.amount_due(), Money::from_cents(11645));
}

#[tokio::test]
async fn test_store_checkout_over_file_storage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    let gateway = MockPaymentGateway::new();
    let clock = ManualClock::at(test_time());
    let sessions = Arc::new(service(&path, &gateway, &clock));
    let store = checkout_store(
        CheckoutEnvironment::new(Arc::clone(&sessions), Arc::new(clock.clone()))
            .with_tick(Duration::from_millis(10)),
    );
    let wait = Duration::from_secs(5);

    store
        .send(FlowAction::OpenTicketSelection {
            event_id: EventId::new(),
            catalog: catalog(),
        })
        .await
        .unwrap();
    store.send(FlowAction::AddToCart { ticket_id: TicketId::from(3u32) }).await.unwrap();
    store
        .send_and_wait_for(
            FlowAction::ProceedToCheckout,
            |a| matches!(a, FlowAction::SessionInitialized { .. }),
            wait,
        )
        .await
        .unwrap();
    let session_id = store.state(|s| s.session_id()).await.unwrap();
    assert!(sessions.session(&session_id).await.is_ok());

    store
        .send_and_wait_for(
            FlowAction::SubmitBuyerInfo { form: buyer() },
            |a| matches!(a, FlowAction::PaymentIntentCreated { .. }),
            wait,
        )
        .await
        .unwrap();
    store
        .send_and_wait_for(
            FlowAction::SubmitPayment { card: card() },
            |a| matches!(a, FlowAction::PaymentSucceeded { .. }),
            wait,
        )
        .await
        .unwrap();
    store.settle(wait).await.unwrap();

    let (step, order) = store.state(|s| (s.step, s.order.clone())).await;
    assert_eq!(step, CheckoutStep::Completed);
    assert_eq!(order.unwrap().total_amount, Money::from_cents(7900));

    // Completing a checkout deletes its session from the file
    assert!(matches!(
        sessions.session(&session_id).await,
        Err(CheckoutError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_sharing_a_file_keep_every_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    let gateway = MockPaymentGateway::new();
    let clock = ManualClock::at(test_time());
    let left = Arc::new(service(&path, &gateway, &clock));
    let right = Arc::new(service(&path, &gateway, &clock));

    let mut starts = Vec::new();
    for _ in 0..25 {
        for sessions in [&left, &right] {
            let sessions = Arc::clone(sessions);
            starts.push(tokio::spawn(async move {
                sessions.initialize_session(&cart(), EventId::new()).await
            }));
        }
    }

    let mut ids = Vec::new();
    for start in starts {
        ids.push(start.await.unwrap().unwrap().session_id);
    }
    assert_eq!(ids.len(), 50);

    let reader = service(&path, &gateway, &clock);
    for id in &ids {
        let report = reader.get_session_status(id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Initialized);
    }
}
