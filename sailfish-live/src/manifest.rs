// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report and test-case manifests.
//!
//! These types mirror the JSON documents a Sailfish report publishes while a
//! run is in progress. Unknown fields are preserved so that consumers can get
//! at test case names, statuses and so on without this crate having to model
//! them.

use crate::errors::FetchError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::BTreeMap, fmt};

/// A revision index within a fragment.
///
/// Revisions increase monotonically as the source appends data.
pub type Revision = u64;

/// The stable integer identifying a test case within a report.
///
/// This is the `order` field of a test-case manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ordinal(pub u64);

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The top-level report manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportManifest {
    /// Metadata for each test case in the run, in run order.
    #[serde(default)]
    pub metadata: Vec<TestCaseMetadata>,

    /// When the run finished, or `None` while it is still running.
    #[serde(default)]
    pub finish_time: Option<String>,

    /// Fields this crate doesn't interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ReportManifest {
    /// Parses a report manifest fetched from `path`.
    pub fn from_slice(path: &str, data: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(data).map_err(|error| FetchError::Manifest {
            path: path.to_owned(),
            error,
        })
    }

    /// Returns the metadata entry of the test case that is still running, if
    /// any.
    ///
    /// The source guarantees there is at most one such entry.
    pub fn live_test_case(&self) -> Option<&TestCaseMetadata> {
        self.metadata.iter().find(|entry| entry.is_running())
    }

    /// Returns true if the run has finished and no test case is running.
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some() && self.live_test_case().is_none()
    }

    /// Returns true if `self` differs from `previous` in a way listeners care
    /// about.
    ///
    /// Only the number of test cases and the hash of the test case that was
    /// live in `previous` are compared, which keeps idle polls cheap.
    pub fn has_changed_since(&self, previous: &ReportManifest) -> bool {
        if self.metadata.len() != previous.metadata.len() {
            return true;
        }
        match previous.live_test_case() {
            Some(prev_live) => self
                .metadata
                .iter()
                .find(|entry| entry.id == prev_live.id)
                .is_none_or(|entry| entry.hash != prev_live.hash),
            None => false,
        }
    }
}

/// Metadata for a single test case, as listed in the report manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseMetadata {
    /// The stable identifier of the test case.
    pub id: String,

    /// A hash that changes whenever the test case's data changes.
    pub hash: i64,

    /// When the test case finished, or `None` while it is running.
    #[serde(default)]
    pub finish_time: Option<String>,

    /// The path of the test case's live manifest, relative to the report
    /// root.
    #[serde(default, rename = "jsonpFileName")]
    pub file_name: Option<String>,

    /// Fields this crate doesn't interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestCaseMetadata {
    /// Returns true if this test case hasn't finished yet.
    pub fn is_running(&self) -> bool {
        self.finish_time.is_none()
    }
}

/// The live manifest of a single test case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseManifest {
    /// The test case's ordinal within the report.
    pub order: Ordinal,

    /// When the test case's data last changed.
    #[serde(default)]
    pub last_update: Option<String>,

    /// When the test case finished, or `None` while it is running.
    #[serde(default)]
    pub finish_time: Option<String>,

    /// The per-category fragment index.
    #[serde(default)]
    pub files: FileIndex,

    /// Fields this crate doesn't interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestCaseManifest {
    /// Parses a test-case manifest fetched from `path`.
    pub fn from_slice(path: &str, data: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(data).map_err(|error| FetchError::Manifest {
            path: path.to_owned(),
            error,
        })
    }

    /// Returns true if the test case has finished.
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }
}

/// A category of fragment data.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "SmolStr", into = "SmolStr")]
pub enum FragmentCategory {
    /// Action-tree nodes.
    Action,

    /// Protocol messages.
    Message,

    /// Log entries. These are only fetched once log watching is enabled.
    LogEntry,

    /// A category this version doesn't know about.
    Other(SmolStr),
}

impl FragmentCategory {
    /// The categories this crate knows how to handle.
    pub const KNOWN: [Self; 3] = [Self::Action, Self::Message, Self::LogEntry];

    /// Returns the name of the category as it appears in a file index.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Action => "action",
            Self::Message => "message",
            Self::LogEntry => "logentry",
            Self::Other(name) => name,
        }
    }
}

impl From<SmolStr> for FragmentCategory {
    fn from(name: SmolStr) -> Self {
        match name.as_str() {
            "action" => Self::Action,
            "message" => Self::Message,
            "logentry" => Self::LogEntry,
            _ => Self::Other(name),
        }
    }
}

impl From<FragmentCategory> for SmolStr {
    fn from(category: FragmentCategory) -> Self {
        match category {
            FragmentCategory::Other(name) => name,
            known => SmolStr::new(known.as_str()),
        }
    }
}

impl fmt::Display for FragmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fragment index of a test case: for each category, which fragment
/// files exist and the newest revision each of them holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIndex {
    categories: BTreeMap<FragmentCategory, FileIndexEntry>,
}

impl FileIndex {
    /// Creates an empty file index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `category`, if present.
    pub fn get(&self, category: &FragmentCategory) -> Option<&FileIndexEntry> {
        self.categories.get(category)
    }

    /// Inserts or replaces the entry for `category`.
    pub fn insert(&mut self, category: FragmentCategory, entry: FileIndexEntry) {
        self.categories.insert(category, entry);
    }

    /// Iterates over all categories and their entries.
    pub fn iter(&self) -> impl Iterator<Item = (&FragmentCategory, &FileIndexEntry)> {
        self.categories.iter()
    }

    /// Returns the advertised record count for `category`, or 0 if absent.
    pub fn count(&self, category: &FragmentCategory) -> u64 {
        self.get(category).map_or(0, |entry| entry.count)
    }

    /// Records that `path` in `category` has been loaded up to `revision`.
    ///
    /// `source` is the index the revision was taken from: its count and
    /// last-update time are carried over so that the loaded index describes
    /// the same state.
    pub fn mark_loaded(
        &mut self,
        category: &FragmentCategory,
        path: &str,
        revision: Revision,
        source: &FileIndex,
    ) {
        let entry = self.categories.entry(category.clone()).or_default();
        if let Some(source_entry) = source.get(category) {
            entry.count = source_entry.count;
            entry.last_update.clone_from(&source_entry.last_update);
        }
        entry.data_files.insert(path.to_owned(), revision);
    }
}

/// A single category's entry within a [`FileIndex`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    /// The total number of records in this category.
    #[serde(default)]
    pub count: u64,

    /// Fragment path to newest revision.
    #[serde(default)]
    pub data_files: BTreeMap<String, Revision>,

    /// When this category last changed.
    #[serde(default)]
    pub last_update: Option<String>,
}
