// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator task.
//!
//! The coordinator owns every piece of mutable live-update state: the last
//! polled manifests, the loaded file index of the watched test case and the
//! records merged so far. It runs as a single task and handles commands,
//! timer ticks and the results of the poll and batch tasks it spawns one at a
//! time, so no state is ever observed mid-update.

use super::{
    LiveUpdateState, StopReason,
    internal_events::{BatchFinished, Command, InternalEvent, LoopEvent, WatchId},
};
use crate::{
    config::LiveUpdateConfig,
    diff::{WatchedCategories, diff},
    dispatch::{Listeners, UpdateDispatcher},
    errors::FetchError,
    fetch::{BatchMode, FragmentFetcher},
    guard::InFlightRegistry,
    manifest::{FileIndex, FragmentCategory, ReportManifest, TestCaseManifest},
    record::MergedRecords,
    session::{SessionToken, SessionTracker},
    transport::Transport,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinSet,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

/// tokio panics on a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The categories whose merged record counts decide whether a finished test
/// case is fully loaded.
const COMPLETION_CATEGORIES: [FragmentCategory; 2] =
    [FragmentCategory::Action, FragmentCategory::Message];

pub(super) struct Coordinator {
    config: LiveUpdateConfig,
    transport: Arc<dyn Transport>,
    dispatcher: UpdateDispatcher,
    sessions: SessionTracker,
    fetcher: FragmentFetcher,
    watched: WatchedCategories,
    event_tx: UnboundedSender<InternalEvent>,
    state_tx: watch::Sender<LiveUpdateState>,
    tasks: JoinSet<()>,
    next_watch_id: u64,
    report: Option<ReportWatch>,
    report_finished: bool,
    test_case: Option<TestCaseWatch>,
    halted: bool,
}

struct ReportWatch {
    id: WatchId,
    interval: Interval,
    poll_in_flight: bool,
    last: Option<ReportManifest>,
}

struct TestCaseWatch {
    id: WatchId,
    path: String,
    // None once the test case is fully loaded.
    interval: Option<Interval>,
    poll_in_flight: bool,
    session: Option<SessionToken>,
    last_manifest: Option<TestCaseManifest>,
    // None until the first batch completes: the next batch is a full fetch.
    loaded: Option<FileIndex>,
    merged: MergedRecords,
    batch_in_flight: bool,
}

impl Coordinator {
    pub(super) fn new(
        config: LiveUpdateConfig,
        transport: Arc<dyn Transport>,
        listeners: Listeners,
        event_tx: UnboundedSender<InternalEvent>,
        state_tx: watch::Sender<LiveUpdateState>,
    ) -> Self {
        let sessions = SessionTracker::new();
        let fetcher = FragmentFetcher::new(
            transport.clone(),
            sessions.active(),
            InFlightRegistry::new(),
            config.fragment_retries,
        );
        let watched = WatchedCategories::new(config.watch_logs);

        Self {
            config,
            transport,
            dispatcher: UpdateDispatcher::new(listeners),
            sessions,
            fetcher,
            watched,
            event_tx,
            state_tx,
            tasks: JoinSet::new(),
            next_watch_id: 0,
            report: None,
            report_finished: false,
            test_case: None,
            halted: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut command_rx: UnboundedReceiver<Command>,
        mut event_rx: UnboundedReceiver<InternalEvent>,
    ) {
        loop {
            let event = tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => LoopEvent::Command(command),
                        None => {
                            debug!("live-update handle dropped, shutting down");
                            break;
                        }
                    }
                }
                // The coordinator holds a sender, so this never returns None.
                Some(event) = event_rx.recv() => LoopEvent::Internal(event),
                () = tick(self.report.as_mut().map(|watch| &mut watch.interval)) => {
                    LoopEvent::ReportTick
                }
                () = tick(self.test_case.as_mut().and_then(|watch| watch.interval.as_mut())) => {
                    LoopEvent::TestCaseTick
                }
                Some(res) = self.tasks.join_next() => {
                    if let Err(error) = res
                        && error.is_panic()
                    {
                        warn!("live-update task panicked: {error}");
                    }
                    continue;
                }
            };

            self.handle_event(event);
            self.publish_state();
        }

        self.stop_test_case_watch();
        self.tasks.shutdown().await;
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command(Command::StartWatchingReport) => self.start_watching_report(),
            LoopEvent::Command(Command::StopWatchingReport) => {
                if self.report.take().is_some() {
                    debug!("stopped watching report");
                }
            }
            LoopEvent::Command(Command::StartWatchingTestCase { path }) => {
                self.start_watching_test_case(path)
            }
            LoopEvent::Command(Command::StopWatchingTestCase) => self.stop_test_case_watch(),
            LoopEvent::Command(Command::StartWatchingLogs) => self.start_watching_logs(),
            LoopEvent::Internal(InternalEvent::ReportPolled { watch, result }) => {
                self.report_polled(watch, result)
            }
            LoopEvent::Internal(InternalEvent::TestCasePolled { watch, result }) => {
                self.test_case_polled(watch, result)
            }
            LoopEvent::Internal(InternalEvent::BatchFinished(finished)) => {
                self.batch_finished(finished)
            }
            LoopEvent::ReportTick => self.poll_report(),
            LoopEvent::TestCaseTick => self.poll_test_case(),
        }
    }

    fn start_watching_report(&mut self) {
        if self.report.is_some() {
            debug!("already watching report");
            return;
        }
        self.halted = false;
        self.report_finished = false;
        let id = self.next_watch_id();
        debug!(%id, path = %self.config.report_path, "started watching report");
        self.report = Some(ReportWatch {
            id,
            interval: poll_interval(self.config.report_poll_interval),
            poll_in_flight: false,
            last: None,
        });
    }

    fn start_watching_test_case(&mut self, path: String) {
        self.stop_test_case_watch();
        self.halted = false;
        let id = self.next_watch_id();
        debug!(%id, %path, "started watching test case");
        self.test_case = Some(TestCaseWatch {
            id,
            path,
            interval: Some(poll_interval(self.config.test_case_poll_interval)),
            poll_in_flight: false,
            session: None,
            last_manifest: None,
            loaded: None,
            merged: MergedRecords::new(),
            batch_in_flight: false,
        });
    }

    fn stop_test_case_watch(&mut self) {
        let Some(watch) = self.test_case.take() else {
            return;
        };
        if let Some(token) = watch.session {
            let cancelled = self.fetcher.registry().cancel_session(token);
            debug!(id = %watch.id, %token, cancelled, "stopped watching test case");
        }
        self.sessions.deactivate();
    }

    fn start_watching_logs(&mut self) {
        if self.watched.logs() {
            return;
        }
        self.watched = WatchedCategories::new(true);
        debug!("started watching logs");
        if self
            .test_case
            .as_ref()
            .is_some_and(|watch| watch.loaded.is_some())
        {
            self.reconcile();
        }
    }

    fn poll_report(&mut self) {
        let Some(watch) = self.report.as_mut() else {
            return;
        };
        if watch.poll_in_flight {
            debug!(id = %watch.id, "report poll still outstanding, skipping tick");
            return;
        }
        watch.poll_in_flight = true;

        let id = watch.id;
        let transport = self.transport.clone();
        let path = self.config.report_path.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            let result = match transport.fetch(&path).await {
                Ok(data) => ReportManifest::from_slice(&path, &data),
                Err(error) => Err(error.into()),
            };
            // The coordinator may have exited in the meantime.
            let _ = event_tx.send(InternalEvent::ReportPolled { watch: id, result });
        });
    }

    fn poll_test_case(&mut self) {
        let Some(watch) = self.test_case.as_mut() else {
            return;
        };
        if watch.poll_in_flight {
            debug!(id = %watch.id, "test case poll still outstanding, skipping tick");
            return;
        }
        watch.poll_in_flight = true;

        let id = watch.id;
        let transport = self.transport.clone();
        let path = watch.path.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            let result = match transport.fetch(&path).await {
                Ok(data) => TestCaseManifest::from_slice(&path, &data),
                Err(error) => Err(error.into()),
            };
            let _ = event_tx.send(InternalEvent::TestCasePolled { watch: id, result });
        });
    }

    fn report_polled(&mut self, id: WatchId, result: Result<ReportManifest, FetchError>) {
        let Some(watch) = self.report.as_mut().filter(|watch| watch.id == id) else {
            debug!(%id, "discarding report poll for inactive watch");
            return;
        };
        watch.poll_in_flight = false;

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(error) => {
                self.halt(error);
                return;
            }
        };

        let changed = watch
            .last
            .as_ref()
            .is_none_or(|previous| manifest.has_changed_since(previous));
        if changed {
            self.dispatcher.report_updated(&manifest);
        }

        if manifest.is_finished() {
            debug!(%id, "report finished, stopping report watch");
            self.dispatcher.report_finished(&manifest);
            self.report = None;
            self.report_finished = true;
        } else {
            watch.last = Some(manifest);
        }
    }

    fn test_case_polled(&mut self, id: WatchId, result: Result<TestCaseManifest, FetchError>) {
        let Some(watch) = self.test_case.as_mut().filter(|watch| watch.id == id) else {
            debug!(%id, "discarding test case poll for inactive watch");
            return;
        };
        watch.poll_in_flight = false;

        let manifest = match result {
            Ok(manifest) => manifest,
            Err(error) => {
                self.halt(error);
                return;
            }
        };

        if watch.session.is_none() {
            watch.session = Some(self.sessions.activate(manifest.order));
        }
        self.dispatcher.test_case_updated(&manifest);

        let files_changed = watch
            .last_manifest
            .as_ref()
            .is_none_or(|previous| previous.files != manifest.files);
        let needs_reconcile = watch.loaded.is_none() || files_changed;
        watch.last_manifest = Some(manifest);

        if needs_reconcile {
            self.reconcile();
        }
        self.check_test_case_complete();
    }

    /// Starts a batch for whatever the loaded file index is missing relative
    /// to the last polled manifest.
    fn reconcile(&mut self) {
        let Some(watch) = self.test_case.as_mut() else {
            return;
        };
        if watch.batch_in_flight {
            debug!(id = %watch.id, "batch still in flight, deferring reconcile");
            return;
        }
        let (Some(token), Some(manifest)) = (watch.session, watch.last_manifest.as_ref()) else {
            return;
        };

        let mode = if watch.loaded.is_some() {
            BatchMode::Incremental
        } else {
            BatchMode::Full
        };
        let deltas = diff(watch.loaded.as_ref(), &manifest.files, self.watched);
        if deltas.is_empty() {
            watch.loaded.get_or_insert_with(FileIndex::new);
            return;
        }

        debug!(
            id = %watch.id,
            %token,
            %mode,
            fragments = deltas.len(),
            "starting batch",
        );
        watch.batch_in_flight = true;

        let id = watch.id;
        let source = manifest.files.clone();
        let fetcher = self.fetcher.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            let result = fetcher.fetch_batch(deltas.clone(), mode, token).await;
            let _ = event_tx.send(InternalEvent::BatchFinished(BatchFinished {
                watch: id,
                token,
                mode,
                deltas,
                source,
                result,
            }));
        });
    }

    fn batch_finished(&mut self, finished: BatchFinished) {
        let BatchFinished {
            watch: id,
            token,
            mode,
            deltas,
            source,
            result,
        } = finished;
        let Some(watch) = self.test_case.as_mut().filter(|watch| watch.id == id) else {
            debug!(%id, %token, "discarding batch for inactive watch");
            return;
        };
        watch.batch_in_flight = false;

        let records = match result {
            Ok(records) => records,
            Err(error) if error.is_cancelled() => {
                debug!(%id, %token, %mode, "batch cancelled");
                return;
            }
            Err(error) => {
                self.halt(error);
                return;
            }
        };
        if self.sessions.current() != Some(token) {
            debug!(%id, %token, "discarding batch for inactive session");
            return;
        }

        let loaded = watch.loaded.get_or_insert_with(FileIndex::new);
        for delta in &deltas {
            loaded.mark_loaded(&delta.category, &delta.path, delta.target, &source);
        }
        watch.merged.merge_all(&records);
        let invoked = self.dispatcher.dispatch(records, token.ordinal());
        debug!(%id, %token, %mode, invoked, "batch applied");

        // The manifest may have advanced while the batch was in flight.
        self.reconcile();
        self.check_test_case_complete();
    }

    fn check_test_case_complete(&mut self) {
        let Some(watch) = self.test_case.as_mut() else {
            return;
        };
        if watch.interval.is_none() || watch.batch_in_flight {
            return;
        }
        let Some(manifest) = &watch.last_manifest else {
            return;
        };
        if !manifest.is_finished() {
            return;
        }
        let fully_loaded = COMPLETION_CATEGORIES
            .iter()
            .all(|category| watch.merged.count(category) == manifest.files.count(category));
        if fully_loaded {
            debug!(id = %watch.id, "test case fully loaded, stopping test case polling");
            watch.interval = None;
        }
    }

    /// Stops all polling after a failure.
    fn halt(&mut self, error: FetchError) {
        warn!("live updates halted: {error}");
        self.dispatcher.fetch_error(Arc::new(error));
        self.report = None;
        self.stop_test_case_watch();
        self.halted = true;
    }

    fn next_watch_id(&mut self) -> WatchId {
        let id = WatchId(self.next_watch_id);
        self.next_watch_id += 1;
        id
    }

    fn current_state(&self) -> LiveUpdateState {
        if self.halted {
            return LiveUpdateState::Stopped(StopReason::ConnectionError);
        }
        let report = self.report.is_some();
        let (test_case, test_case_loaded) = match &self.test_case {
            Some(watch) => (watch.interval.is_some(), watch.interval.is_none()),
            None => (false, false),
        };
        match (report, test_case) {
            (true, true) => LiveUpdateState::WatchingReportAndTestCase,
            (true, false) => LiveUpdateState::WatchingReport,
            (false, true) => LiveUpdateState::WatchingTestCase,
            (false, false) if self.report_finished || test_case_loaded => {
                LiveUpdateState::Stopped(StopReason::Finished)
            }
            (false, false) => LiveUpdateState::Idle,
        }
    }

    fn publish_state(&self) {
        let state = self.current_state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "live-update state changed");
                *current = state;
                true
            }
        });
    }
}

fn poll_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(MIN_POLL_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
