//! Dependencies of the checkout flow reducer.

use crate::session::SessionService;
use crate::timer::DEFAULT_TICK;
use boxoffice_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Environment for the checkout flow
#[derive(Clone)]
pub struct CheckoutEnvironment {
    /// Time source for deadlines
    pub clock: Arc<dyn Clock>,
    /// Session operations
    pub sessions: Arc<SessionService>,
    /// Countdown tick
    pub tick: Duration,
}

impl CheckoutEnvironment {
    /// Environment ticking once per second
    #[must_use]
    pub fn new(sessions: Arc<SessionService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions,
            tick: DEFAULT_TICK,
        }
    }

    /// Replaces the countdown tick (at least one millisecond)
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Clock accessor
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
