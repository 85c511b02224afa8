// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Notifications sent to the layers that consume live updates.
//!
//! Consumers register callbacks on [`Listeners`]. The coordinator hands them
//! to an [`UpdateDispatcher`], which stamps every notification with a
//! [`Generation`] and a timestamp before invoking the matching callback.
//!
//! Generations increase by one per notification, so two notifications that
//! carry equal payloads can still be told apart.

use crate::{
    errors::FetchError,
    manifest::{FragmentCategory, Ordinal, ReportManifest, TestCaseManifest},
    record::{CategorizedRecords, Record},
};
use chrono::{DateTime, FixedOffset, Local};
use debug_ignore::DebugIgnore;
use std::{fmt, sync::Arc};
use tracing::{trace, warn};

/// A monotonically increasing counter stamped on every notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Returns the raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// New records for one category of a test case.
#[derive(Clone, Debug)]
pub struct RecordUpdate {
    /// The generation of this notification.
    pub generation: Generation,

    /// The time at which the notification was generated, including the
    /// offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The ordinal of the test case the records belong to.
    pub ordinal: Ordinal,

    /// The category of the records.
    pub category: FragmentCategory,

    /// The records, in revision order per fragment. Never empty.
    pub records: Vec<Record>,
}

/// A freshly polled manifest.
#[derive(Clone, Debug)]
pub struct ManifestUpdate<M> {
    /// The generation of this notification.
    pub generation: Generation,

    /// The time at which the notification was generated, including the
    /// offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The manifest.
    pub manifest: M,
}

/// The data source could not be reached, or a fragment fetch failed after
/// exhausting its retries.
#[derive(Clone, Debug)]
pub struct ConnectionError {
    /// The generation of this notification.
    pub generation: Generation,

    /// The time at which the notification was generated, including the
    /// offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The error that halted polling.
    pub error: Arc<FetchError>,
}

type Callback<T> = DebugIgnore<Option<Box<dyn FnMut(T) + Send>>>;

/// The callbacks that receive live updates.
///
/// Every callback is optional.
#[derive(Debug, Default)]
pub struct Listeners {
    action_update: Callback<RecordUpdate>,
    message_update: Callback<RecordUpdate>,
    logs_update: Callback<RecordUpdate>,
    test_case_update: Callback<ManifestUpdate<TestCaseManifest>>,
    report_update: Callback<ManifestUpdate<ReportManifest>>,
    report_finish: Callback<ManifestUpdate<ReportManifest>>,
    fetch_error: Callback<ConnectionError>,
}

impl Listeners {
    /// Creates a set with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback for new action-tree records.
    pub fn on_action_update(mut self, f: impl FnMut(RecordUpdate) + Send + 'static) -> Self {
        self.action_update = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback for new protocol messages.
    pub fn on_message_update(mut self, f: impl FnMut(RecordUpdate) + Send + 'static) -> Self {
        self.message_update = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback for new log entries.
    pub fn on_logs_update(mut self, f: impl FnMut(RecordUpdate) + Send + 'static) -> Self {
        self.logs_update = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback invoked with every polled test-case manifest.
    pub fn on_test_case_update(
        mut self,
        f: impl FnMut(ManifestUpdate<TestCaseManifest>) + Send + 'static,
    ) -> Self {
        self.test_case_update = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback invoked when the report manifest changes.
    pub fn on_report_update(
        mut self,
        f: impl FnMut(ManifestUpdate<ReportManifest>) + Send + 'static,
    ) -> Self {
        self.report_update = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback invoked once when the report finishes.
    pub fn on_report_finish(
        mut self,
        f: impl FnMut(ManifestUpdate<ReportManifest>) + Send + 'static,
    ) -> Self {
        self.report_finish = DebugIgnore(Some(Box::new(f)));
        self
    }

    /// Sets the callback invoked when polling halts because of an error.
    pub fn on_fetch_error(mut self, f: impl FnMut(ConnectionError) + Send + 'static) -> Self {
        self.fetch_error = DebugIgnore(Some(Box::new(f)));
        self
    }
}

/// Stamps notifications and routes them to [`Listeners`].
#[derive(Debug)]
pub struct UpdateDispatcher {
    listeners: Listeners,
    next_generation: u64,
}

impl UpdateDispatcher {
    /// Creates a dispatcher that notifies `listeners`.
    pub fn new(listeners: Listeners) -> Self {
        Self {
            listeners,
            next_generation: 0,
        }
    }

    /// Hands every non-empty category of `update` to its callback, tagged with
    /// `ordinal`. Returns the number of callbacks invoked.
    ///
    /// Categories without a registered callback are skipped, and categories
    /// this crate doesn't know about are skipped with a warning.
    pub fn dispatch(&mut self, update: CategorizedRecords, ordinal: Ordinal) -> usize {
        let mut invoked = 0;
        for (category, records) in update {
            if records.is_empty() {
                continue;
            }
            let callback = match &category {
                FragmentCategory::Action => &mut self.listeners.action_update,
                FragmentCategory::Message => &mut self.listeners.message_update,
                FragmentCategory::LogEntry => &mut self.listeners.logs_update,
                FragmentCategory::Other(name) => {
                    warn!(
                        "ignoring {} records of unknown category `{name}` for test case {ordinal}",
                        records.len(),
                    );
                    continue;
                }
            };
            let Some(callback) = callback.0.as_mut() else {
                trace!(%category, %ordinal, "no listener registered, dropping records");
                continue;
            };

            let generation = Self::bump(&mut self.next_generation);
            callback(RecordUpdate {
                generation,
                timestamp: now(),
                ordinal,
                category,
                records,
            });
            invoked += 1;
        }
        invoked
    }

    /// Notifies the test-case listener of a polled manifest.
    pub fn test_case_updated(&mut self, manifest: &TestCaseManifest) {
        let generation = Self::bump(&mut self.next_generation);
        if let Some(callback) = self.listeners.test_case_update.0.as_mut() {
            callback(ManifestUpdate {
                generation,
                timestamp: now(),
                manifest: manifest.clone(),
            });
        }
    }

    /// Notifies the report listener of a changed manifest.
    pub fn report_updated(&mut self, manifest: &ReportManifest) {
        let generation = Self::bump(&mut self.next_generation);
        if let Some(callback) = self.listeners.report_update.0.as_mut() {
            callback(ManifestUpdate {
                generation,
                timestamp: now(),
                manifest: manifest.clone(),
            });
        }
    }

    /// Notifies the report-finished listener.
    pub fn report_finished(&mut self, manifest: &ReportManifest) {
        let generation = Self::bump(&mut self.next_generation);
        if let Some(callback) = self.listeners.report_finish.0.as_mut() {
            callback(ManifestUpdate {
                generation,
                timestamp: now(),
                manifest: manifest.clone(),
            });
        }
    }

    /// Notifies the error listener that polling has halted.
    pub fn fetch_error(&mut self, error: Arc<FetchError>) {
        let generation = Self::bump(&mut self.next_generation);
        if let Some(callback) = self.listeners.fetch_error.0.as_mut() {
            callback(ConnectionError {
                generation,
                timestamp: now(),
                error,
            });
        }
    }

    fn bump(next_generation: &mut u64) -> Generation {
        let generation = Generation(*next_generation);
        *next_generation += 1;
        generation
    }
}

fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}
