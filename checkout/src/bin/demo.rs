//! Walks one buyer through a complete checkout.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin demo
//! ```
//!
//! Configuration comes from the environment (a `.env` file is honoured),
//! for example:
//!
//! ```bash
//! SESSION_STORAGE=file SESSION_STORAGE_PATH=/tmp/sessions.json \
//! GATEWAY_MOCK_LATENCY_MS=200 RUST_LOG=debug cargo run --bin demo
//! ```

use anyhow::{Context, bail};
use boxoffice_checkout::config::Config;
use boxoffice_checkout::flow::{CheckoutEnvironment, CheckoutStore, FlowAction, checkout_store};
use boxoffice_checkout::metrics::register_checkout_metrics;
use boxoffice_checkout::payment_gateway::{gateway_from_config, test_cards};
use boxoffice_checkout::repository::repository_from_config;
use boxoffice_checkout::session::{SessionService, SessionSettings};
use boxoffice_checkout::types::{BuyerInfoForm, CardDetails, Currency, EventId, Money, Ticket};
use boxoffice_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Box Office checkout demo ===");

    let config = Config::from_env().context("invalid configuration")?;
    register_checkout_metrics();

    let repository = repository_from_config(&config.storage);
    let gateway = gateway_from_config(&config.gateway).context("payment gateway unavailable")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sessions = Arc::new(
        SessionService::new(repository, gateway, Arc::clone(&clock))
            .with_settings(SessionSettings::from_config(&config)),
    );
    let sweeper = config.session.purge_interval().map(|every| {
        Arc::clone(&sessions).spawn_purge_task(every, config.session.purge_grace())
    });
    let env = CheckoutEnvironment::new(sessions, clock)
        .with_tick(config.session.tick_interval());
    let store = checkout_store(env);

    info!(
        gateway = ?config.gateway.kind,
        storage = ?config.storage.backend,
        ttl_secs = config.session.ttl_secs,
        "Checkout engine ready"
    );

    // Ticket selection
    store
        .send(FlowAction::OpenTicketSelection {
            event_id: EventId::new(),
            catalog: catalog(),
        })
        .await?;
    store.send(FlowAction::AddToCart { ticket_id: "ga".into() }).await?;
    store.send(FlowAction::AddToCart { ticket_id: "vip".into() }).await?;
    store
        .send(FlowAction::ChangeQuantity {
            ticket_id: "ga".into(),
            quantity: 2,
        })
        .await?;
    let total = store.state(|s| s.total).await;
    info!(%total, "Cart ready");

    // Session, promo code, buyer details, payment
    run_step(&store, FlowAction::ProceedToCheckout, |a| {
        matches!(a, FlowAction::SessionInitialized { .. })
    })
    .await?;
    if let Some(countdown) = store.state(|s| s.countdown(SystemClock.now())).await {
        info!(remaining = %countdown, "Checkout session opened");
    }

    run_step(
        &store,
        FlowAction::ApplyPromoCode {
            code: "welcome".to_string(),
        },
        |a| matches!(a, FlowAction::PromoCodeApplied { .. }),
    )
    .await?;
    if let Some(promo) = store.state(|s| s.promo.clone()).await {
        info!(
            valid = promo.is_valid,
            message = %promo.message,
            total = %promo.total_after_discount,
            "Promo code"
        );
    }

    run_step(
        &store,
        FlowAction::SubmitBuyerInfo {
            form: BuyerInfoForm {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                phone: "+44 20 7946 0958".to_string(),
            },
        },
        |a| matches!(a, FlowAction::PaymentIntentCreated { .. }),
    )
    .await?;

    run_step(
        &store,
        FlowAction::SubmitPayment {
            card: CardDetails {
                holder_name: "Ada Lovelace".to_string(),
                number: test_cards::SUCCESS.to_string(),
                exp_month: 12,
                exp_year: 2030,
                cvc: "123".to_string(),
            },
        },
        |a| matches!(a, FlowAction::PaymentSucceeded { .. }),
    )
    .await?;

    let order = store
        .state(|s| s.order.clone())
        .await
        .context("checkout finished without an order")?;
    println!("{}", serde_json::to_string_pretty(&order)?);

    store.shutdown(Duration::from_secs(5)).await?;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("=== Demo complete ===");
    Ok(())
}

/// Sends `action` and waits for the result matching `done` or a failure
async fn run_step<F>(store: &CheckoutStore, action: FlowAction, done: F) -> anyhow::Result<()>
where
    F: Fn(&FlowAction) -> bool,
{
    let outcome = store
        .send_and_wait_for(
            action,
            |a| done(a) || matches!(a, FlowAction::RequestFailed { .. }),
            STEP_TIMEOUT,
        )
        .await?;

    if let FlowAction::RequestFailed { error, .. } = outcome {
        bail!("checkout step failed: {error}");
    }
    if let Some(error) = store.state(|s| s.error.clone()).await {
        bail!("checkout step rejected: {error}");
    }
    Ok(())
}

fn catalog() -> Vec<Ticket> {
    vec![
        Ticket::new("ga", "General Admission", Money::from_cents(2900), Currency::usd(), 500)
            .with_description("Standing room on the main floor"),
        Ticket::new("vip", "VIP", Money::from_cents(7900), Currency::usd(), 40)
            .with_description("Reserved seating and lounge access"),
    ]
}
