// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    coordinator::Coordinator,
    internal_events::{Command, InternalEvent},
};
use crate::{config::LiveUpdateConfig, dispatch::Listeners, transport::Transport};
use std::{fmt, sync::Arc};
use tokio::{
    sync::{
        mpsc::{self, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tracing::debug;

/// The state of a [`LiveUpdateService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveUpdateState {
    /// Nothing is being watched.
    Idle,

    /// The report manifest is being polled.
    WatchingReport,

    /// A test case is being polled, but the report isn't. This happens after
    /// the report has finished while the watched test case is still being
    /// loaded.
    WatchingTestCase,

    /// Both the report manifest and a test case are being polled.
    WatchingReportAndTestCase,

    /// Polling has stopped.
    Stopped(StopReason),
}

impl fmt::Display for LiveUpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::WatchingReport => f.write_str("watching report"),
            Self::WatchingTestCase => f.write_str("watching test case"),
            Self::WatchingReportAndTestCase => f.write_str("watching report and test case"),
            Self::Stopped(StopReason::Finished) => f.write_str("stopped (loading finished)"),
            Self::Stopped(StopReason::ConnectionError) => {
                f.write_str("stopped (connection error)")
            }
        }
    }
}

/// Why a [`LiveUpdateService`] stopped polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Loading completed. Either the report finished and every watched test
    /// case is fully loaded, or only a test case was watched and it is now
    /// fully loaded.
    Finished,

    /// A manifest poll failed, or a fragment fetch failed after exhausting
    /// its retries. Polling resumes once
    /// [`start_watching_report`](LiveUpdateService::start_watching_report)
    /// is called again.
    ConnectionError,
}

/// Builds a [`LiveUpdateService`].
#[derive(Debug)]
pub struct LiveUpdateServiceBuilder {
    config: LiveUpdateConfig,
    listeners: Listeners,
}

impl LiveUpdateServiceBuilder {
    /// Creates a new builder with the given config and no listeners.
    pub fn new(config: LiveUpdateConfig) -> Self {
        Self {
            config,
            listeners: Listeners::new(),
        }
    }

    /// Sets the callbacks that receive updates.
    pub fn listeners(&mut self, listeners: Listeners) -> &mut Self {
        self.listeners = listeners;
        self
    }

    /// Spawns the service's coordinator onto the current tokio runtime.
    ///
    /// Listener callbacks are invoked on the coordinator task, one at a time.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(self, transport: Arc<dyn Transport>) -> LiveUpdateService {
        let (command_tx, command_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<InternalEvent>();
        let (state_tx, state_rx) = watch::channel(LiveUpdateState::Idle);

        let coordinator = Coordinator::new(
            self.config,
            transport,
            self.listeners,
            event_tx,
            state_tx,
        );
        let task = tokio::spawn(coordinator.run(command_rx, event_rx));

        LiveUpdateService {
            commands: command_tx,
            state: state_rx,
            task,
        }
    }
}

/// A handle to a running live-update coordinator.
///
/// Every method sends a command to the coordinator and returns immediately.
/// The coordinator shuts down when this handle is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Debug)]
pub struct LiveUpdateService {
    commands: UnboundedSender<Command>,
    state: watch::Receiver<LiveUpdateState>,
    task: JoinHandle<()>,
}

impl LiveUpdateService {
    /// Starts polling the report manifest.
    ///
    /// After a connection error, this resumes polling.
    pub fn start_watching_report(&self) {
        self.send(Command::StartWatchingReport);
    }

    /// Stops polling the report manifest.
    pub fn stop_watching_report(&self) {
        self.send(Command::StopWatchingReport);
    }

    /// Starts watching the test case whose live manifest is at `path`.
    ///
    /// Any previously watched test case stops being watched first, and all of
    /// its in-flight fetches are cancelled.
    pub fn start_watching_test_case(&self, path: impl Into<String>) {
        self.send(Command::StartWatchingTestCase { path: path.into() });
    }

    /// Stops watching the current test case, cancelling its in-flight
    /// fetches.
    pub fn stop_watching_test_case(&self) {
        self.send(Command::StopWatchingTestCase);
    }

    /// Starts fetching log entries.
    ///
    /// If a test case is already loaded, its log entries are fetched right
    /// away.
    pub fn start_watching_logs(&self) {
        self.send(Command::StartWatchingLogs);
    }

    /// Returns the current state.
    pub fn state(&self) -> LiveUpdateState {
        *self.state.borrow()
    }

    /// Returns a receiver that is notified of state changes.
    pub fn subscribe(&self) -> watch::Receiver<LiveUpdateState> {
        self.state.clone()
    }

    /// Waits until the service stops polling, returning why.
    ///
    /// Returns `None` if the coordinator exited first.
    pub async fn wait_stopped(&self) -> Option<StopReason> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(|state| matches!(state, LiveUpdateState::Stopped(_)))
            .await
            .ok()?;
        match *state {
            LiveUpdateState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Shuts the coordinator down, cancelling all outstanding work, and waits
    /// for it to exit.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(error) = task.await {
            debug!("live-update coordinator exited abnormally: {error}");
        }
    }

    fn send(&self, command: Command) {
        if let Err(error) = self.commands.send(command) {
            debug!(
                command = ?error.0,
                "live-update coordinator has exited, ignoring command",
            );
        }
    }
}
