//! Checkout countdown.
//!
//! A single absolute deadline drives every step. [`Countdown`] is the pure
//! view of `deadline - now`; [`ExpiryTimer`] recomputes it on a fixed tick,
//! publishes each snapshot on a watch channel, and reports expiry once.

use boxoffice_core::CancellationToken;
use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Below this much time left the countdown is urgent
pub const URGENT_THRESHOLD: Duration = Duration::from_secs(120);

/// Default countdown tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Time left until a deadline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Countdown {
    remaining: Duration,
}

impl Countdown {
    /// Countdown to `deadline` as seen at `now` (zero once passed)
    #[must_use]
    pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            remaining: (deadline - now).to_std().unwrap_or_default(),
        }
    }

    /// Countdown with a known amount of time left
    #[must_use]
    pub const fn from_remaining(remaining: Duration) -> Self {
        Self { remaining }
    }

    /// Time left
    #[must_use]
    pub const fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Whole minutes left
    #[must_use]
    pub const fn minutes(&self) -> u64 {
        self.remaining.as_secs() / 60
    }

    /// Seconds left within the current minute
    #[must_use]
    pub const fn seconds(&self) -> u64 {
        self.remaining.as_secs() % 60
    }

    /// Less than [`URGENT_THRESHOLD`] left but not yet expired
    #[must_use]
    pub const fn is_urgent(&self) -> bool {
        !self.is_expired() && self.remaining.as_millis() < URGENT_THRESHOLD.as_millis()
    }

    /// Nothing left
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        self.remaining.is_zero()
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes(), self.seconds())
    }
}

/// How an [`ExpiryTimer`] stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The deadline passed
    Expired,
    /// The timer was cancelled first
    Cancelled,
}

/// Ticking countdown to a deadline
pub struct ExpiryTimer {
    deadline: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    token: CancellationToken,
    snapshots: watch::Sender<Countdown>,
}

impl ExpiryTimer {
    /// Timer for `deadline`, reading time from `clock` every `tick`
    #[must_use]
    pub fn new(deadline: DateTime<Utc>, clock: Arc<dyn Clock>, tick: Duration) -> Self {
        let (snapshots, _) = watch::channel(Countdown::until(deadline, clock.now()));
        Self {
            deadline,
            clock,
            tick,
            token: CancellationToken::new(),
            snapshots,
        }
    }

    /// Stops the timer when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The deadline
    #[must_use]
    pub const fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Receiver of countdown snapshots, one per tick
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Countdown> {
        self.snapshots.subscribe()
    }

    /// Token that stops the timer
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Ticks until the deadline passes or the timer is cancelled
    pub async fn run(self) -> TimerOutcome {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut was_urgent = false;

        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    tracing::debug!(deadline = %self.deadline, "Expiry timer cancelled");
                    return TimerOutcome::Cancelled;
                }
                _ = interval.tick() => {}
            }

            let countdown = Countdown::until(self.deadline, self.clock.now());
            self.snapshots.send_replace(countdown);

            if countdown.is_expired() {
                tracing::info!(deadline = %self.deadline, "Checkout deadline reached");
                return TimerOutcome::Expired;
            }
            if countdown.is_urgent() && !was_urgent {
                was_urgent = true;
                tracing::info!(remaining = %countdown, "Checkout countdown is urgent");
            }
            tracing::trace!(remaining = %countdown, "Countdown tick");
        }
    }

    /// Runs the timer on a task, calling `on_expire` once if the deadline passes
    pub fn spawn<F>(self, on_expire: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.token.clone();
        let snapshots = self.subscribe();
        let task = tokio::spawn(async move {
            let outcome = self.run().await;
            if outcome == TimerOutcome::Expired {
                on_expire();
            }
            outcome
        });
        TimerHandle {
            token,
            snapshots,
            task,
        }
    }
}

/// Handle to a spawned [`ExpiryTimer`]
pub struct TimerHandle {
    token: CancellationToken,
    snapshots: watch::Receiver<Countdown>,
    task: JoinHandle<TimerOutcome>,
}

impl TimerHandle {
    /// Latest countdown snapshot
    #[must_use]
    pub fn countdown(&self) -> Countdown {
        *self.snapshots.borrow()
    }

    /// Receiver of countdown snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Countdown> {
        self.snapshots.clone()
    }

    /// Stops the timer; the expiry callback will not run afterwards
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the timer to stop
    ///
    /// A panicked or aborted task reads as cancelled.
    pub async fn finished(self) -> TimerOutcome {
        self.task.await.unwrap_or(TimerOutcome::Cancelled)
    }
}
