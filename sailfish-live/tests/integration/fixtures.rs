// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;
use color_eyre::eyre::Result;
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::{self, BoxStream},
};
use indoc::indoc;
use sailfish_live::{
    config::LiveUpdateConfig,
    dispatch::{Listeners, RecordUpdate},
    errors::TransportError,
    live::{LiveUpdateService, LiveUpdateServiceBuilder},
    manifest::{FragmentCategory, Ordinal, Revision},
    transport::{FragmentPayload, Transport},
};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Once},
    time::Duration,
};
use tokio::sync::watch;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = color_eyre::install();
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn test_config() -> Result<LiveUpdateConfig> {
    let config = LiveUpdateConfig::from_toml_str(indoc! {r#"
        report-poll-interval = "1s"
        test-case-poll-interval = "1s"
        fragment-retries = 2
    "#})?;
    Ok(config)
}

/// Lets every task that's ready run, without advancing past the next poll.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Advances the paused clock by `n` poll intervals.
pub(crate) async fn advance_polls(n: u32) {
    for _ in 0..n {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    settle().await;
}

/// An in-memory data source that tests mutate while the service polls it.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Default)]
struct ScriptedInner {
    documents: HashMap<String, Value>,
    fragments: HashMap<String, Vec<(Revision, Value)>>,
    gates: HashMap<String, watch::Sender<bool>>,
    failures: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publishes `document` at `path`, replacing any earlier version.
    pub(crate) fn set_document(&self, path: &str, document: Value) {
        self.lock().documents.insert(path.to_owned(), document);
    }

    /// Appends a revision to the fragment at `path`.
    pub(crate) fn append(&self, path: &str, revision: Revision, payload: Value) {
        self.lock()
            .fragments
            .entry(path.to_owned())
            .or_default()
            .push((revision, payload));
    }

    /// Holds every fetch of `path` until [`open_gate`](Self::open_gate) is
    /// called.
    pub(crate) fn close_gate(&self, path: &str) {
        let (sender, _) = watch::channel(false);
        self.lock().gates.insert(path.to_owned(), sender);
    }

    pub(crate) fn open_gate(&self, path: &str) {
        if let Some(gate) = self.lock().gates.get(path) {
            gate.send_replace(true);
        }
    }

    /// Makes the next `count` fetches of `path` fail.
    pub(crate) fn fail_next(&self, path: &str, count: usize) {
        self.lock().failures.insert(path.to_owned(), count);
    }

    /// Returns the number of times `path` has been requested.
    pub(crate) fn fetches(&self, path: &str) -> usize {
        self.lock().fetches.get(path).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedInner> {
        self.inner.lock().unwrap()
    }

    /// Records a request for `path`, returning an error if a failure is
    /// scripted for it.
    fn request(&self, path: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        *inner.fetches.entry(path.to_owned()).or_default() += 1;
        if let Some(remaining) = inner.failures.get_mut(path)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportError::request(path, "scripted failure"));
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        let res = self.request(path).and_then(|()| {
            self.lock()
                .documents
                .get(path)
                .map(|document| Bytes::from(document.to_string()))
                .ok_or_else(|| TransportError::request(path, "not found"))
        });
        async move { res }.boxed()
    }

    fn fetch_fragment(
        &self,
        path: &str,
    ) -> BoxStream<'static, Result<FragmentPayload, TransportError>> {
        if let Err(error) = self.request(path) {
            return stream::once(async move { Err(error) }).boxed();
        }

        let gate = self.lock().gates.get(path).map(watch::Sender::subscribe);
        let inner = self.inner.clone();
        let path = path.to_owned();
        stream::once(async move {
            if let Some(mut gate) = gate {
                let _ = gate.wait_for(|open| *open).await;
            }
            // Read the fragment once the gate opens, as a real source would.
            let payloads = inner
                .lock()
                .unwrap()
                .fragments
                .get(&path)
                .cloned()
                .unwrap_or_default();
            stream::iter(
                payloads
                    .into_iter()
                    .map(|(revision, payload)| Ok(FragmentPayload { revision, payload })),
            )
        })
        .flatten()
        .boxed()
    }
}

/// Builds a report manifest. Each entry is `(id, hash, running)`.
pub(crate) fn report_manifest(entries: &[(&str, i64, bool)], finished: bool) -> Value {
    let metadata: Vec<_> = entries
        .iter()
        .map(|&(id, hash, running)| {
            json!({
                "id": id,
                "hash": hash,
                "name": format!("test {id}"),
                "finishTime": timestamp_unless(running, "2024-03-01T10:00:00Z"),
                "jsonpFileName": format!("{id}.json"),
            })
        })
        .collect();
    json!({
        "metadata": metadata,
        "finishTime": timestamp_unless(!finished, "2024-03-01T10:05:00Z"),
    })
}

/// Builds a test-case manifest. Each category is `(name, count, files)`.
pub(crate) fn test_case_manifest(
    order: u64,
    categories: &[(&str, u64, &[(&str, Revision)])],
    finished: bool,
) -> Value {
    let files: serde_json::Map<String, Value> = categories
        .iter()
        .map(|&(name, count, data_files)| {
            let data_files: serde_json::Map<String, Value> = data_files
                .iter()
                .map(|&(path, revision)| (path.to_owned(), json!(revision)))
                .collect();
            (
                name.to_owned(),
                json!({
                    "count": count,
                    "dataFiles": data_files,
                    "lastUpdate": "2024-03-01T10:00:00Z",
                }),
            )
        })
        .collect();
    json!({
        "order": order,
        "lastUpdate": "2024-03-01T10:00:00Z",
        "finishTime": timestamp_unless(!finished, "2024-03-01T10:01:00Z"),
        "files": files,
    })
}

fn timestamp_unless(running: bool, timestamp: &str) -> Value {
    if running {
        Value::Null
    } else {
        json!(timestamp)
    }
}

/// A notification observed by a [`Recorder`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Observed {
    Records {
        ordinal: Ordinal,
        category: FragmentCategory,
        ids: Vec<Value>,
    },
    TestCaseUpdated {
        order: Ordinal,
    },
    ReportUpdated {
        test_cases: usize,
    },
    ReportFinished,
    ConnectionError,
}

/// Records every notification a service sends.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    observed: Arc<Mutex<Vec<Observed>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn listeners(&self) -> Listeners {
        let records = |recorder: &Recorder| {
            let observed = recorder.observed.clone();
            move |update: RecordUpdate| {
                observed.lock().unwrap().push(Observed::Records {
                    ordinal: update.ordinal,
                    category: update.category,
                    ids: update
                        .records
                        .iter()
                        .map(|record| record.body["id"].clone())
                        .collect(),
                });
            }
        };
        let test_case = self.observed.clone();
        let report = self.observed.clone();
        let finish = self.observed.clone();
        let error = self.observed.clone();

        Listeners::new()
            .on_action_update(records(self))
            .on_message_update(records(self))
            .on_logs_update(records(self))
            .on_test_case_update(move |update| {
                test_case.lock().unwrap().push(Observed::TestCaseUpdated {
                    order: update.manifest.order,
                });
            })
            .on_report_update(move |update| {
                report.lock().unwrap().push(Observed::ReportUpdated {
                    test_cases: update.manifest.metadata.len(),
                });
            })
            .on_report_finish(move |_| {
                finish.lock().unwrap().push(Observed::ReportFinished);
            })
            .on_fetch_error(move |_| {
                error.lock().unwrap().push(Observed::ConnectionError);
            })
    }

    pub(crate) fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }

    /// Returns the ids delivered for `category`, one list per notification.
    pub(crate) fn records(&self, category: FragmentCategory) -> Vec<(Ordinal, Vec<Value>)> {
        self.observed()
            .into_iter()
            .filter_map(|observed| match observed {
                Observed::Records {
                    ordinal,
                    category: c,
                    ids,
                } if c == category => Some((ordinal, ids)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, f: impl Fn(&Observed) -> bool) -> usize {
        self.observed().iter().filter(|observed| f(observed)).count()
    }
}

pub(crate) fn spawn_service(
    transport: &ScriptedTransport,
    recorder: &Recorder,
) -> Result<LiveUpdateService> {
    let mut builder = LiveUpdateServiceBuilder::new(test_config()?);
    builder.listeners(recorder.listeners());
    Ok(builder.spawn(Arc::new(transport.clone())))
}
