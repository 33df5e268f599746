//! # Box Office Core
//!
//! The vocabulary every checkout feature is written in.
//!
//! A feature is a [`reducer::Reducer`]: given the current state, an action
//! and an environment of injected collaborators, it mutates the state and
//! returns [`effect::Effect`] values. Effects describe work such as a
//! session call or a countdown; the runtime `Store` runs them and sends any
//! action they yield back through the reducer.
//!
//! ```ignore
//! use boxoffice_core::{SmallVec, effect::Effect, reducer::Reducer, smallvec};
//!
//! impl Reducer for SeatReducer {
//!     type State = Seats;
//!     type Action = SeatAction;
//!     type Environment = SeatEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         seats: &mut Seats,
//!         action: SeatAction,
//!         _env: &SeatEnvironment,
//!     ) -> SmallVec<[Effect<SeatAction>; 4]> {
//!         seats.held += 1;
//!         smallvec![Effect::None]
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use chrono::{DateTime, Utc};
pub use smallvec::{smallvec, SmallVec};
pub use tokio_util::sync::CancellationToken;

/// Reducers
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// Decides how a feature reacts to an action
    ///
    /// Implementations must stay synchronous and free of I/O: anything that
    /// waits goes into the returned effects.
    pub trait Reducer {
        /// Feature state, owned by the store
        type State;

        /// Commands and effect results
        type Action;

        /// Injected collaborators (clock, services)
        type Environment;

        /// Applies `action` to `state` and returns the work it triggers
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effects returned by reducers
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Work for the runtime to perform after a reduce
    ///
    /// Building an effect does nothing; the `Store` runs it.
    pub enum Effect<Action> {
        /// Nothing to do
        None,

        /// Effects started together
        Parallel(Vec<Effect<Action>>),

        /// Effects started one after another
        Sequential(Vec<Effect<Action>>),

        /// Sends `action` after `duration`
        Delay {
            /// Wait before sending
            duration: Duration,
            /// Action sent afterwards
            action: Box<Action>,
        },

        /// Async work; a `Some` output goes back through the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// Effect that is abandoned once `token` is cancelled
        ///
        /// A cancelled effect never feeds an action back into the reducer.
        Cancellable {
            /// Token owned by whoever may abandon the work
            token: CancellationToken,
            /// The wrapped effect
            effect: Box<Effect<Action>>,
        },
    }

    // Futures have no Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::Cancellable { token, effect } => f
                    .debug_struct("Effect::Cancellable")
                    .field("cancelled", &token.is_cancelled())
                    .field("effect", effect)
                    .finish(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Runs `effects` concurrently
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Runs `effects` in order
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Boxes `fut` as an [`Effect::Future`]
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }

        /// Make this effect abandonable through `token`
        #[must_use]
        pub fn cancellable(self, token: CancellationToken) -> Effect<Action> {
            Effect::Cancellable {
                token,
                effect: Box::new(self),
            }
        }

        /// True if the effect (or any nested effect) is an async computation
        #[must_use]
        pub fn is_async(&self) -> bool {
            match self {
                Effect::None => false,
                Effect::Future(_) | Effect::Delay { .. } => true,
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    effects.iter().any(Effect::is_async)
                },
                Effect::Cancellable { effect, .. } => effect.is_async(),
            }
        }
    }
}

/// Collaborators shared by every feature environment
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Source of the current time
    pub trait Clock: Send + Sync {
        /// Now, in UTC
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
