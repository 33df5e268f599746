//! # Box Office Runtime
//!
//! Runtime for reducers: the [`Store`](store::Store) owns state, runs the
//! reducer for every action, executes the returned effects on the Tokio
//! runtime, and feeds any action an effect produces back into the reducer.
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_runtime::Store;
//!
//! let store = Store::new(initial_state, my_reducer, environment);
//!
//! // Send an action
//! store.send(Action::DoSomething).await?;
//!
//! // Read state
//! let value = store.state(|s| s.some_field).await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use boxoffice_core::{CancellationToken, effect::Effect, reducer::Reducer};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Retry logic with exponential backoff
pub mod retry;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a matching action
        #[error("Timeout waiting for action")]
        Timeout,

        /// Action broadcast channel closed
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;
pub use store::Store;

/// Decrements the pending-effect counter when an effect task ends, even if
/// the task panics.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store module - the runtime coordinator
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicUsize, BoxFuture, CancellationToken, Duration, Effect, Ordering,
        PendingGuard, Reducer, RwLock, StoreError,
    };
    use tokio::sync::broadcast;

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock`; reducer calls are serialized)
    /// 2. Reducer (business logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (with feedback loop)
    ///
    /// Cloning a Store is cheap; clones share state.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: Arc<R>,
        environment: Arc<E>,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        /// Every action produced by an effect is broadcast here once it has
        /// been reduced, so callers can wait for results.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: Arc::clone(&self.reducer),
                environment: Arc::clone(&self.environment),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + Sync + Clone + std::fmt::Debug + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        ///
        /// The action broadcast channel holds 64 actions.
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_broadcast_capacity(initial_state, reducer, environment, 64)
        }

        /// Create a new store with a custom action broadcast capacity
        #[must_use]
        pub fn with_broadcast_capacity(
            initial_state: S,
            reducer: R,
            environment: E,
            capacity: usize,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(capacity.max(1));

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer: Arc::new(reducer),
                environment: Arc::new(environment),
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                action_broadcast,
            }
        }

        /// Send an action to the store
        ///
        /// Runs the reducer under the state write lock, then starts the
        /// returned effects. Returns once effects are started, not finished.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::warn!("Rejecting action, store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            tracing::trace!(?action, "Reducing action");
            let effects = {
                let mut state = self.state.write().await;
                self.reducer.reduce(&mut state, action, &self.environment)
            };

            for effect in effects {
                self.spawn_effect(effect);
            }
            Ok(())
        }

        /// Send an action and wait for the first effect-produced action
        /// matching `predicate`
        ///
        /// Subscribes before sending, so a fast effect cannot be missed. The
        /// returned action has already been reduced.
        ///
        /// # Errors
        ///
        /// - [`StoreError::Timeout`] if no matching action arrives in time
        /// - [`StoreError::ChannelClosed`] if the broadcast channel closed
        /// - [`StoreError::ShutdownInProgress`] if the store is shutting down
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            F: Fn(&A) -> bool,
        {
            let mut rx = self.action_broadcast.subscribe();
            self.send(action).await?;

            let wait = async {
                loop {
                    match rx.recv().await {
                        Ok(produced) if predicate(&produced) => return Ok(produced),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Action observer lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::ChannelClosed);
                        },
                    }
                }
            };

            tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to actions produced by effects
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Read from the current state
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        /// Number of effect tasks still running
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            self.pending_effects.load(Ordering::SeqCst)
        }

        /// Stop accepting actions and wait for running effects to finish
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still
        /// running when `timeout` elapses.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            self.shutdown.store(true, Ordering::SeqCst);
            tracing::info!("Store shutdown initiated");

            self.settle(timeout).await.inspect_err(|_| {
                tracing::warn!(pending = self.pending_effects(), "Store shutdown timed out");
            })?;
            tracing::info!("Store shutdown complete");
            Ok(())
        }

        /// Wait until no effect task is running, without stopping the store
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still
        /// running when `timeout` elapses.
        pub async fn settle(&self, timeout: Duration) -> Result<(), StoreError> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let pending = self.pending_effects();
                if pending == 0 {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(StoreError::ShutdownTimeout(pending));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        fn spawn_effect(&self, effect: Effect<A>) {
            if matches!(effect, Effect::None) {
                return;
            }

            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let guard = PendingGuard(Arc::clone(&self.pending_effects));
            let task = self.clone().run_effect(effect, None);

            tokio::spawn(async move {
                let _guard = guard;
                task.await;
            });
        }

        /// Execute an effect to completion
        ///
        /// `token` is the innermost enclosing cancellation token. A cancelled
        /// effect stops waiting and never feeds an action back.
        fn run_effect(
            self,
            effect: Effect<A>,
            token: Option<CancellationToken>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                match effect {
                    Effect::None => {},
                    Effect::Future(fut) => {
                        let produced = match &token {
                            Some(token) => tokio::select! {
                                () = token.cancelled() => {
                                    tracing::debug!("Effect::Future cancelled");
                                    None
                                }
                                produced = fut => produced,
                            },
                            None => fut.await,
                        };
                        if let Some(action) = produced {
                            self.feed_back(action, token.as_ref()).await;
                        }
                    },
                    Effect::Delay { duration, action } => {
                        let elapsed = match &token {
                            Some(token) => tokio::select! {
                                () = token.cancelled() => false,
                                () = tokio::time::sleep(duration) => true,
                            },
                            None => {
                                tokio::time::sleep(duration).await;
                                true
                            },
                        };
                        if elapsed {
                            self.feed_back(*action, token.as_ref()).await;
                        } else {
                            tracing::debug!("Effect::Delay cancelled");
                        }
                    },
                    Effect::Parallel(effects) => {
                        let tasks = effects
                            .into_iter()
                            .map(|effect| self.clone().run_effect(effect, token.clone()));
                        futures::future::join_all(tasks).await;
                    },
                    Effect::Sequential(effects) => {
                        for effect in effects {
                            if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                                break;
                            }
                            self.clone().run_effect(effect, token.clone()).await;
                        }
                    },
                    Effect::Cancellable { token, effect } => {
                        self.run_effect(*effect, Some(token)).await;
                    },
                }
            })
        }

        async fn feed_back(&self, action: A, token: Option<&CancellationToken>) {
            if token.is_some_and(CancellationToken::is_cancelled) {
                tracing::debug!(?action, "Dropping action from cancelled effect");
                return;
            }

            if let Err(error) = self.send(action.clone()).await {
                tracing::warn!(%error, "Effect produced an action the store could not accept");
            }

            // No receivers is fine
            let _ = self.action_broadcast.send(action);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use boxoffice_core::{SmallVec, smallvec};

    #[derive(Clone, Debug, PartialEq)]
    enum Action {
        Start,
        StartCancellable,
        Cancel,
        Finished(u32),
    }

    #[derive(Default)]
    struct State {
        finished: Vec<u32>,
        token: Option<CancellationToken>,
    }

    struct TestReducer;

    impl Reducer for TestReducer {
        type State = State;
        type Action = Action;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut State,
            action: Action,
            _env: &(),
        ) -> SmallVec<[Effect<Action>; 4]> {
            match action {
                Action::Start => smallvec![Effect::chain(vec![
                    Effect::future(async { Some(Action::Finished(1)) }),
                    Effect::Delay {
                        duration: Duration::from_millis(5),
                        action: Box::new(Action::Finished(2)),
                    },
                ])],
                Action::StartCancellable => {
                    let token = CancellationToken::new();
                    state.token = Some(token.clone());
                    smallvec![
                        Effect::Delay {
                            duration: Duration::from_millis(200),
                            action: Box::new(Action::Finished(99)),
                        }
                        .cancellable(token)
                    ]
                },
                Action::Cancel => {
                    if let Some(token) = state.token.take() {
                        token.cancel();
                    }
                    smallvec![Effect::None]
                },
                Action::Finished(n) => {
                    state.finished.push(n);
                    smallvec![Effect::None]
                },
            }
        }
    }

    #[tokio::test]
    async fn test_effects_feed_actions_back() {
        let store = Store::new(State::default(), TestReducer, ());

        let result = store
            .send_and_wait_for(
                Action::Start,
                |a| matches!(a, Action::Finished(2)),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(result, Action::Finished(2));

        store.settle(Duration::from_secs(1)).await.unwrap();
        let finished = store.state(|s| s.finished.clone()).await;
        assert_eq!(finished, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_effect_never_reports_back() {
        let store = Store::new(State::default(), TestReducer, ());
        let mut rx = store.subscribe_actions();

        store.send(Action::StartCancellable).await.unwrap();
        assert_eq!(store.pending_effects(), 1);
        store.send(Action::Cancel).await.unwrap();

        store.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(store.state(|s| s.finished.is_empty()).await);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_rejected() {
        let store = Store::new(State::default(), TestReducer, ());
        store.shutdown(Duration::from_millis(10)).await.unwrap();

        let err = store.send(Action::Start).await.unwrap_err();
        assert_eq!(err, StoreError::ShutdownInProgress);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let store = Store::new(State::default(), TestReducer, ());

        let err = store
            .send_and_wait_for(
                Action::Cancel,
                |a| matches!(a, Action::Finished(_)),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Timeout);
    }
}
