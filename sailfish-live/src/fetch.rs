// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fetching of fragment revision windows.
//!
//! A [`FragmentFetcher`] turns the deltas produced by [`diff`](crate::diff)
//! into decoded records. Each fragment is fetched through the
//! [`InFlightRegistry`], so that every fetch is retried according to the
//! configured policy and can be cancelled in bulk when its session ends.

use crate::{
    config::RetryPolicy,
    diff::FragmentDelta,
    errors::FetchError,
    guard::InFlightRegistry,
    manifest::{FragmentCategory, Revision},
    record::{CategorizedRecords, Record},
    session::{ActiveSession, SessionToken},
    transport::{FragmentPayload, Transport},
};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use indexmap::IndexMap;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::debug;

/// How the fragments of a batch are scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Nothing has been loaded yet. Fragments within a category are fetched
    /// one after the other; categories are fetched concurrently.
    Full,

    /// Some data is already loaded. Every fragment is fetched concurrently.
    Incremental,
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental => f.write_str("incremental"),
        }
    }
}

/// Fetches fragment revision windows on behalf of sessions.
#[derive(Clone)]
pub struct FragmentFetcher {
    transport: Arc<dyn Transport>,
    active: ActiveSession,
    registry: InFlightRegistry,
    policy: RetryPolicy,
}

impl fmt::Debug for FragmentFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentFetcher")
            .field("active", &self.active)
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FragmentFetcher {
    /// Creates a new fetcher.
    ///
    /// `active` is consulted whenever a fragment's target revision arrives;
    /// fetches are recorded in `registry` while outstanding.
    pub fn new(
        transport: Arc<dyn Transport>,
        active: ActiveSession,
        registry: InFlightRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            active,
            registry,
            policy,
        }
    }

    /// Returns the registry fetches are recorded in.
    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Fetches the revisions of one fragment described by `delta`, on behalf
    /// of `token`.
    ///
    /// The fragment's stream is read until `delta.target` arrives. Payloads
    /// outside the delta's window are ignored, and the records of the
    /// remaining payloads are returned in revision order regardless of the
    /// order they arrived in.
    ///
    /// If `token` is no longer the active session when the target revision
    /// arrives, this fails with [`FetchError::Cancelled`].
    pub fn fetch_fragment(
        &self,
        delta: &FragmentDelta,
        token: SessionToken,
    ) -> BoxFuture<'static, Result<Vec<Record>, FetchError>> {
        let transport = self.transport.clone();
        let active = self.active.clone();
        let attempt_delta = delta.clone();
        let guarded = self
            .registry
            .guard(&delta.path, token, self.policy, move || {
                fetch_window(
                    transport.clone(),
                    active.clone(),
                    attempt_delta.clone(),
                    token,
                )
            });
        guarded.result
    }

    /// Fetches every delta in `deltas` on behalf of `token`, scheduling them
    /// according to `mode`.
    ///
    /// Records are grouped per category, in delta order. If any fragment is
    /// cancelled the whole batch is cancelled; otherwise the first fragment
    /// (in delta order) that failed after retries fails the batch.
    pub async fn fetch_batch(
        &self,
        deltas: Vec<FragmentDelta>,
        mode: BatchMode,
        token: SessionToken,
    ) -> Result<CategorizedRecords, FetchError> {
        let results: Vec<(FragmentCategory, Result<Vec<Record>, FetchError>)> = match mode {
            BatchMode::Full => {
                let mut by_category: IndexMap<FragmentCategory, Vec<FragmentDelta>> =
                    IndexMap::new();
                for delta in deltas {
                    by_category
                        .entry(delta.category.clone())
                        .or_default()
                        .push(delta);
                }

                let categories = by_category.into_iter().map(|(category, deltas)| {
                    let fetcher = self.clone();
                    async move {
                        let mut records = Vec::new();
                        for delta in &deltas {
                            match fetcher.fetch_fragment(delta, token).await {
                                Ok(fetched) => records.extend(fetched),
                                Err(error) => return (category, Err(error)),
                            }
                        }
                        (category, Ok(records))
                    }
                });
                futures::future::join_all(categories).await
            }
            BatchMode::Incremental => {
                let fragments = deltas.iter().map(|delta| {
                    self.fetch_fragment(delta, token)
                        .map(move |res| (delta.category.clone(), res))
                });
                futures::future::join_all(fragments).await
            }
        };

        let mut records = CategorizedRecords::new();
        let mut first_error = None;
        for (category, res) in results {
            match res {
                Ok(fetched) => records.entry(category).or_default().extend(fetched),
                Err(error) if error.is_cancelled() => return Err(FetchError::Cancelled),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(records),
        }
    }
}

/// A single attempt at fetching a fragment's revision window.
async fn fetch_window(
    transport: Arc<dyn Transport>,
    active: ActiveSession,
    delta: FragmentDelta,
    token: SessionToken,
) -> Result<Vec<Record>, FetchError> {
    let mut stream = transport.fetch_fragment(&delta.path);
    let mut window: BTreeMap<Revision, Value> = BTreeMap::new();
    let mut last_seen: Option<Revision> = None;

    while let Some(payload) = stream.next().await {
        let FragmentPayload { revision, payload } = payload?;
        last_seen = last_seen.max(Some(revision));

        if !delta.start.admits(revision) || revision > delta.target {
            debug!(
                path = %delta.path,
                revision,
                start = %delta.start,
                target = delta.target,
                "ignoring revision outside of window",
            );
            continue;
        }

        // A revision that's re-sent replaces the earlier copy.
        window.insert(revision, payload);

        if revision == delta.target {
            if !active.is_current(token) {
                debug!(
                    path = %delta.path,
                    %token,
                    "discarding fragment for inactive session",
                );
                return Err(FetchError::Cancelled);
            }
            return Ok(window
                .into_iter()
                .flat_map(|(revision, payload)| {
                    Record::decode_payload(&delta.path, revision, payload)
                })
                .collect());
        }
    }

    Err(FetchError::IncompleteFragment {
        path: delta.path,
        target: delta.target,
        last_seen,
    })
}
