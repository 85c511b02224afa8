// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry and cancellation for fragment fetches.
//!
//! [`guard`] wraps an attempt-producing closure with a retry budget and a
//! [`CancelHandle`]. [`InFlightRegistry`] additionally records which fetches
//! are outstanding for which session, so that all of them can be cancelled at
//! once when the user navigates to another test case.

use crate::{config::RetryPolicy, errors::FetchError, session::SessionToken};
use futures::{FutureExt, future::BoxFuture};
use rand::{Rng, distr::OpenClosed01};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cancels a guarded fetch.
///
/// Cancelling is idempotent, and cancelling a fetch that has already settled
/// does nothing.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Cancels the fetch.
    ///
    /// No further attempts are made, and an attempt or backoff delay in
    /// progress is abandoned.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true if [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// A fetch wrapped with retries and cancellation.
pub struct Guarded<T> {
    /// Resolves with the first successful attempt, the last failure once the
    /// retry budget is exhausted, or [`FetchError::Cancelled`].
    pub result: BoxFuture<'static, Result<T, FetchError>>,

    /// Cancels the fetch.
    pub cancel: CancelHandle,
}

/// Wraps `make_attempt` with retries according to `policy`.
///
/// A failed attempt is retried until `policy.attempts()` attempts have been
/// made. An attempt that fails with [`FetchError::Cancelled`] is never
/// retried.
pub fn guard<T, F, Fut>(policy: RetryPolicy, make_attempt: F) -> Guarded<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    let (cancel, cancelled) = CancelHandle::new();
    Guarded {
        result: run_guarded(policy, make_attempt, cancelled).boxed(),
        cancel,
    }
}

async fn run_guarded<T, F, Fut>(
    policy: RetryPolicy,
    mut make_attempt: F,
    mut cancelled: watch::Receiver<bool>,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let total_attempts = policy.attempts().max(1);
    let mut backoff = BackoffIter::new(policy);
    let mut attempt = 1;

    loop {
        if *cancelled.borrow() {
            return Err(FetchError::Cancelled);
        }

        let res = tokio::select! {
            biased;
            () = wait_cancelled(&mut cancelled) => return Err(FetchError::Cancelled),
            res = make_attempt() => res,
        };

        let error = match res {
            Ok(value) => return Ok(value),
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => error,
        };

        let Some(delay) = backoff.next() else {
            debug!(attempt, total_attempts, "fetch failed, retry budget exhausted");
            return Err(error);
        };

        warn!(
            attempt,
            total_attempts,
            ?delay,
            "fetch failed, retrying: {error}",
        );
        attempt += 1;

        if !delay.is_zero() {
            tokio::select! {
                biased;
                () = wait_cancelled(&mut cancelled) => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    if cancelled.wait_for(|cancelled| *cancelled).await.is_err() {
        // Every cancel handle is gone, so this fetch can no longer be
        // cancelled.
        std::future::pending::<()>().await;
    }
}

/// A fetch recorded in an [`InFlightRegistry`].
#[derive(Clone, Debug)]
pub struct InFlightFetch {
    /// The fragment path being fetched.
    pub path: String,

    /// The session the fetch belongs to.
    pub owner: SessionToken,

    /// Cancels the fetch.
    pub cancel: CancelHandle,
}

/// The set of guarded fetches that haven't settled yet.
///
/// Entries are added by [`InFlightRegistry::guard`] and removed when the
/// guarded future completes or is dropped.
#[derive(Clone, Debug, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    entries: BTreeMap<u64, InFlightFetch>,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`guard`], but also records the fetch in this registry under
    /// `path` and `owner` until it settles.
    pub fn guard<T, F, Fut>(
        &self,
        path: &str,
        owner: SessionToken,
        policy: RetryPolicy,
        make_attempt: F,
    ) -> Guarded<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (cancel, cancelled) = CancelHandle::new();
        let registration = self.register(InFlightFetch {
            path: path.to_owned(),
            owner,
            cancel: cancel.clone(),
        });
        let result = async move {
            let _registration = registration;
            run_guarded(policy, make_attempt, cancelled).await
        }
        .boxed();
        Guarded { result, cancel }
    }

    /// Cancels every outstanding fetch owned by `owner`, returning how many
    /// were cancelled.
    pub fn cancel_session(&self, owner: SessionToken) -> usize {
        let inner = self.lock();
        let mut count = 0;
        for fetch in inner.entries.values().filter(|fetch| fetch.owner == owner) {
            fetch.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Returns the outstanding fetches owned by `owner`.
    pub fn in_flight(&self, owner: SessionToken) -> Vec<InFlightFetch> {
        self.lock()
            .entries
            .values()
            .filter(|fetch| fetch.owner == owner)
            .cloned()
            .collect()
    }

    /// Returns the total number of outstanding fetches.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if no fetches are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, fetch: InFlightFetch) -> Registration {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, fetch);
        Registration {
            registry: self.clone(),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // The registry's invariants hold between every statement, so a
        // poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a fetch from its registry when dropped.
#[derive(Debug)]
struct Registration {
    registry: InFlightRegistry,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().entries.remove(&self.id);
    }
}

#[derive(Debug)]
struct BackoffIter {
    policy: RetryPolicy,
    current_factor: f64,
    remaining_retries: u32,
}

impl BackoffIter {
    const BACKOFF_EXPONENT: f64 = 2.;

    fn new(policy: RetryPolicy) -> Self {
        let remaining_retries = policy.attempts().saturating_sub(1);
        Self {
            policy,
            current_factor: 1.,
            remaining_retries,
        }
    }

    fn next_delay_and_jitter(&mut self) -> (Duration, bool) {
        match self.policy {
            RetryPolicy::Fixed { delay, jitter, .. } => (delay, jitter),
            RetryPolicy::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => {
                let factor = self.current_factor;
                let exp_delay = delay.mul_f64(factor);

                // Stop multiplying the exponential factor if delay is greater than max_delay.
                if let Some(max_delay) = max_delay
                    && exp_delay > max_delay
                {
                    return (max_delay, jitter);
                }

                self.current_factor *= Self::BACKOFF_EXPONENT;

                (exp_delay, jitter)
            }
        }
    }

    fn apply_jitter(duration: Duration) -> Duration {
        let jitter: f64 = rand::rng().sample(OpenClosed01);
        // Apply jitter in the range (0.5, 1].
        duration.mul_f64(0.5 + jitter / 2.)
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_retries > 0 {
            let (mut delay, jitter) = self.next_delay_and_jitter();
            if jitter {
                delay = Self::apply_jitter(delay);
            }
            self.remaining_retries -= 1;
            Some(delay)
        } else {
            None
        }
    }
}
