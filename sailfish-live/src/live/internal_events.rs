// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events delivered to the coordinator task.
//!
//! Commands come from the [`LiveUpdateService`](super::LiveUpdateService)
//! handle. Internal events come from the poll and batch tasks the coordinator
//! spawns; they carry the [`WatchId`] they were started for so that results
//! for a watch that has since been replaced can be told apart.

use crate::{
    diff::FragmentDelta,
    errors::FetchError,
    fetch::BatchMode,
    manifest::{FileIndex, ReportManifest, TestCaseManifest},
    record::CategorizedRecords,
    session::SessionToken,
};
use std::fmt;

/// Identifies one report or test-case watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct WatchId(pub(super) u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

#[derive(Debug)]
pub(super) enum Command {
    StartWatchingReport,
    StopWatchingReport,
    StartWatchingTestCase { path: String },
    StopWatchingTestCase,
    StartWatchingLogs,
}

#[derive(Debug)]
pub(super) enum InternalEvent {
    ReportPolled {
        watch: WatchId,
        result: Result<ReportManifest, FetchError>,
    },
    TestCasePolled {
        watch: WatchId,
        result: Result<TestCaseManifest, FetchError>,
    },
    BatchFinished(BatchFinished),
}

#[derive(Debug)]
pub(super) struct BatchFinished {
    pub(super) watch: WatchId,
    pub(super) token: SessionToken,
    pub(super) mode: BatchMode,
    pub(super) deltas: Vec<FragmentDelta>,
    /// The file index the deltas were computed against.
    pub(super) source: FileIndex,
    pub(super) result: Result<CategorizedRecords, FetchError>,
}

/// Everything the coordinator loop reacts to.
#[derive(Debug)]
pub(super) enum LoopEvent {
    Command(Command),
    Internal(InternalEvent),
    ReportTick,
    TestCaseTick,
}
