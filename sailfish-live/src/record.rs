// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Records decoded from fragment payloads, and idempotent merging of them.

use crate::manifest::{FragmentCategory, Revision};
use indexmap::IndexMap;
use serde_json::Value;
use std::{collections::BTreeMap, fmt};

/// The identity of a record, used to make merging idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    /// The record's own `id` field.
    Id(String),

    /// The record has no `id`: it's identified by where it was found.
    Position {
        /// The fragment path.
        path: String,

        /// The revision the record arrived with.
        revision: Revision,

        /// The record's index within that revision's payload.
        index: usize,
    },
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Position {
                path,
                revision,
                index,
            } => write!(f, "{path}@{revision}[{index}]"),
        }
    }
}

/// A single logical record: an action node, a message or a log entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// The record's identity.
    pub key: RecordKey,

    /// The revision of the fragment the record arrived with.
    pub revision: Revision,

    /// The record itself.
    pub body: Value,
}

impl Record {
    /// Decodes the records carried by one revision of a fragment.
    ///
    /// An array payload carries one record per element; anything else is a
    /// single record.
    pub fn decode_payload(path: &str, revision: Revision, payload: Value) -> Vec<Record> {
        let bodies = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };
        bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| Record {
                key: record_key(&body).unwrap_or_else(|| RecordKey::Position {
                    path: path.to_owned(),
                    revision,
                    index,
                }),
                revision,
                body,
            })
            .collect()
    }
}

fn record_key(body: &Value) -> Option<RecordKey> {
    match body.get("id")? {
        Value::String(id) => Some(RecordKey::Id(id.clone())),
        Value::Number(id) => Some(RecordKey::Id(id.to_string())),
        _ => None,
    }
}

/// Records grouped by category, in the order they should be applied.
pub type CategorizedRecords = BTreeMap<FragmentCategory, Vec<Record>>;

/// Records merged by key, per category.
///
/// Merging is an upsert: a record that arrives again (for example because a
/// fragment was re-sent by the source) replaces the earlier copy in place, so
/// the set never contains two records with the same key.
#[derive(Clone, Debug, Default)]
pub struct MergedRecords {
    categories: BTreeMap<FragmentCategory, IndexMap<RecordKey, Record>>,
}

impl MergedRecords {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `records` into `category`, returning the number of records that
    /// weren't present before.
    pub fn merge(
        &mut self,
        category: &FragmentCategory,
        records: impl IntoIterator<Item = Record>,
    ) -> usize {
        let merged = self.categories.entry(category.clone()).or_default();
        let before = merged.len();
        for record in records {
            merged.insert(record.key.clone(), record);
        }
        merged.len() - before
    }

    /// Merges every category of `update`.
    pub fn merge_all(&mut self, update: &CategorizedRecords) {
        for (category, records) in update {
            self.merge(category, records.iter().cloned());
        }
    }

    /// Returns the number of distinct records in `category`.
    pub fn count(&self, category: &FragmentCategory) -> u64 {
        self.categories
            .get(category)
            .map_or(0, |records| records.len() as u64)
    }

    /// Iterates over the records in `category` in first-seen order.
    pub fn records(&self, category: &FragmentCategory) -> impl Iterator<Item = &Record> {
        self.categories
            .get(category)
            .into_iter()
            .flat_map(|records| records.values())
    }
}
