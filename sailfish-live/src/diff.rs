// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diffing of file indexes.
//!
//! The differ is pure: it compares what has been loaded against what the
//! source advertises and reports which fragment revisions are missing. It
//! never issues fetches.

use crate::manifest::{FileIndex, FragmentCategory, Revision};
use std::fmt;

/// Which fragment categories the caller wants to keep up to date.
///
/// Actions and messages are always watched. Log entries are opt-in, and
/// categories this crate doesn't know about are never fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchedCategories {
    logs: bool,
}

impl WatchedCategories {
    /// Creates a new set, with log entries included if `logs` is true.
    pub fn new(logs: bool) -> Self {
        Self { logs }
    }

    /// Returns true if log entries are watched.
    pub fn logs(&self) -> bool {
        self.logs
    }

    /// Returns true if `category` is watched.
    pub fn contains(&self, category: &FragmentCategory) -> bool {
        match category {
            FragmentCategory::Action | FragmentCategory::Message => true,
            FragmentCategory::LogEntry => self.logs,
            FragmentCategory::Other(_) => false,
        }
    }
}

/// Where a delta's revision window starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaStart {
    /// Nothing has been loaded for this fragment: fetch from the beginning.
    Beginning,

    /// Revisions before this one have already been loaded.
    From(Revision),
}

impl DeltaStart {
    /// Returns true if `revision` falls at or after this start.
    pub fn admits(self, revision: Revision) -> bool {
        match self {
            Self::Beginning => true,
            Self::From(start) => revision >= start,
        }
    }
}

impl fmt::Display for DeltaStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::From(revision) => write!(f, "{revision}"),
        }
    }
}

/// A fragment that has revisions the caller hasn't loaded yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentDelta {
    /// The category the fragment belongs to.
    pub category: FragmentCategory,

    /// The fragment's path.
    pub path: String,

    /// The first revision that hasn't been loaded.
    pub start: DeltaStart,

    /// The newest revision advertised by the source.
    pub target: Revision,
}

/// Computes the fragments in `next` that are newer than in `previous`.
///
/// If `previous` is `None`, every fragment of every non-empty watched
/// category is reported with a start of [`DeltaStart::Beginning`]. Otherwise
/// a fragment is reported if its path is absent from `previous` (again from
/// the beginning) or its revision has advanced (starting just past the
/// previous revision).
///
/// Categories with a count of zero and categories that aren't in `watched`
/// are skipped entirely.
pub fn diff(
    previous: Option<&FileIndex>,
    next: &FileIndex,
    watched: WatchedCategories,
) -> Vec<FragmentDelta> {
    let mut deltas = Vec::new();

    for (category, entry) in next.iter() {
        if entry.count == 0 || !watched.contains(category) {
            continue;
        }
        let prev_files = previous
            .and_then(|previous| previous.get(category))
            .map(|prev_entry| &prev_entry.data_files);

        for (path, &target) in &entry.data_files {
            let start = match prev_files.and_then(|files| files.get(path)) {
                Some(&prev) if prev >= target => continue,
                Some(&prev) => DeltaStart::From(prev + 1),
                None => DeltaStart::Beginning,
            };
            deltas.push(FragmentDelta {
                category: category.clone(),
                path: path.clone(),
                start,
                target,
            });
        }
    }

    deltas
}
