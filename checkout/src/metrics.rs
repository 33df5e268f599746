//! Business metrics for the checkout engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `checkout_sessions_total{status}` - Sessions by outcome (created, completed, cancelled, expired)
//! - `checkout_promo_codes_total{result}` - Promo code attempts (valid, invalid)
//! - `checkout_payments_total{status}` - Payment attempts (succeeded, failed)
//! - `checkout_payment_revenue_cents_total` - Amount charged in cents
//! - `checkout_tickets_sold_total` - Tickets sold
//! - `checkout_sessions_purged_total` - Expired sessions deleted from storage
//!
//! ## Gauges
//! - `checkout_active_sessions` - Sessions created but not yet finished
//!
//! ## Histograms
//! - `checkout_session_duration_seconds` - Time from session creation to payment

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Initialize and register all checkout metric descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_checkout_metrics() {
    describe_counter!(
        "checkout_sessions_total",
        "Total number of checkout sessions by status (created, completed, cancelled, expired)"
    );
    describe_counter!(
        "checkout_sessions_purged_total",
        "Expired sessions deleted by the purge sweep"
    );
    describe_gauge!(
        "checkout_active_sessions",
        "Current number of checkout sessions in progress"
    );
    describe_histogram!(
        "checkout_session_duration_seconds",
        "Time from session creation to successful payment"
    );

    describe_counter!(
        "checkout_promo_codes_total",
        "Promo code attempts by result (valid, invalid)"
    );

    describe_counter!(
        "checkout_payments_total",
        "Payment attempts by status (succeeded, failed)"
    );
    describe_counter!(
        "checkout_payment_revenue_cents_total",
        "Total amount charged in cents"
    );
    describe_counter!("checkout_tickets_sold_total", "Total number of tickets sold");

    tracing::info!("Checkout metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a session created.
pub fn record_session_created() {
    metrics::counter!("checkout_sessions_total", "status" => "created").increment(1);
    metrics::gauge!("checkout_active_sessions").increment(1.0);
}

/// Record a session paid for.
///
/// # Arguments
///
/// * `tickets` - Number of tickets bought
/// * `amount_cents` - Amount charged
/// * `duration_secs` - Time from session creation to payment
pub fn record_session_completed(tickets: u32, amount_cents: u64, duration_secs: f64) {
    metrics::counter!("checkout_sessions_total", "status" => "completed").increment(1);
    metrics::gauge!("checkout_active_sessions").decrement(1.0);
    metrics::histogram!("checkout_session_duration_seconds").record(duration_secs);
    metrics::counter!("checkout_payments_total", "status" => "succeeded").increment(1);
    metrics::counter!("checkout_payment_revenue_cents_total").increment(amount_cents);
    metrics::counter!("checkout_tickets_sold_total").increment(u64::from(tickets));
    tracing::debug!(tickets, amount_cents, duration_secs, "Recorded session_completed metric");
}

/// Record a session abandoned before payment.
pub fn record_session_cancelled() {
    metrics::counter!("checkout_sessions_total", "status" => "cancelled").increment(1);
    metrics::gauge!("checkout_active_sessions").decrement(1.0);
}

/// Record a session that ran out of time.
pub fn record_session_expired() {
    metrics::counter!("checkout_sessions_total", "status" => "expired").increment(1);
    metrics::gauge!("checkout_active_sessions").decrement(1.0);
}

/// Record expired sessions removed from storage.
pub fn record_sessions_purged(count: usize) {
    metrics::counter!("checkout_sessions_purged_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record a promo code attempt.
pub fn record_promo_code(valid: bool) {
    let result = if valid { "valid" } else { "invalid" };
    metrics::counter!("checkout_promo_codes_total", "result" => result).increment(1);
}

/// Record a failed payment attempt.
///
/// # Arguments
///
/// * `reason` - Failure kind (e.g., "card_declined", "insufficient_funds")
pub fn record_payment_failed(reason: &'static str) {
    metrics::counter!("checkout_payments_total", "status" => "failed", "reason" => reason)
        .increment(1);
    tracing::debug!(reason, "Recorded payment_failed metric");
}
