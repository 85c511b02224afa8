// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, SailfishWatchExitCode},
    output::{OutputContext, OutputOpts, clap_styles},
    reporter::{Reporter, WatchEvent},
};
use camino::Utf8PathBuf;
use clap::Parser;
use sailfish_live::{
    config::LiveUpdateConfig,
    dispatch::Listeners,
    live::{LiveUpdateService, LiveUpdateServiceBuilder, StopReason},
    transport::FsTransport,
};
use std::{io, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Follows a live Sailfish test report, printing each update as it arrives.
///
/// Exits once the report has finished and every watched test case is fully
/// loaded, or with exit code 1 if the report can't be read.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct SailfishWatchApp {
    /// Directory the report is written to
    #[arg(value_name = "REPORT_DIR")]
    report_dir: Utf8PathBuf,

    /// Config file layered over the default config
    #[arg(long, value_name = "FILE", env = "SAILFISH_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Watch the test case whose live manifest is at PATH
    #[arg(long, value_name = "PATH", conflicts_with = "follow_live")]
    test_case: Option<String>,

    /// Watch whichever test case is running, switching as the run moves on
    #[arg(long)]
    follow_live: bool,

    /// Also fetch log entries
    #[arg(long)]
    logs: bool,

    #[command(flatten)]
    output: OutputOpts,
}

impl SailfishWatchApp {
    /// Initializes the logger and output styles.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        if !self.report_dir.is_dir() {
            return Err(ExpectedError::ReportDirNotFound {
                path: self.report_dir,
            });
        }

        let mut config = LiveUpdateConfig::from_sources(self.config.as_deref())?;
        if self.logs {
            config.watch_logs = true;
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sailfish-watch-worker")
            .build()
            .map_err(|err| ExpectedError::TokioRuntimeCreateFailed { err })?;

        let follow = match (self.test_case, self.follow_live) {
            (Some(path), _) => Follow::Fixed(path),
            (None, true) => Follow::Live,
            (None, false) => Follow::ReportOnly,
        };
        let transport = FsTransport::new(self.report_dir);
        let reporter = Reporter::new(output.stdout_styles(), output.verbose);

        runtime.block_on(async move {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let mut builder = LiveUpdateServiceBuilder::new(config);
            builder.listeners(forwarding_listeners(&event_tx));
            drop(event_tx);
            let service = builder.spawn(Arc::new(transport));

            let watch_loop = WatchLoop {
                service,
                events: event_rx,
                reporter,
                follow,
                watched: None,
            };
            watch_loop.run().await
        })
    }
}

/// Which test case the watch follows.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Follow {
    ReportOnly,
    Fixed(String),
    Live,
}

/// Forwards every notification into `sender`, so that they're handled on the
/// watch loop rather than on the coordinator task.
fn forwarding_listeners(sender: &UnboundedSender<WatchEvent>) -> Listeners {
    fn forward<T>(
        sender: &UnboundedSender<WatchEvent>,
        into_event: fn(T) -> WatchEvent,
    ) -> impl FnMut(T) + Send + 'static
    where
        T: 'static,
    {
        let sender = sender.clone();
        move |update| {
            // The receiver is only dropped once the watch loop has exited.
            let _ = sender.send(into_event(update));
        }
    }

    Listeners::new()
        .on_action_update(forward(sender, WatchEvent::records))
        .on_message_update(forward(sender, WatchEvent::records))
        .on_logs_update(forward(sender, WatchEvent::records))
        .on_test_case_update(forward(sender, WatchEvent::test_case_updated))
        .on_report_update(forward(sender, WatchEvent::report_updated))
        .on_report_finish(forward(sender, WatchEvent::report_finished))
        .on_fetch_error(forward(sender, WatchEvent::connection_error))
}

struct WatchLoop {
    service: LiveUpdateService,
    events: UnboundedReceiver<WatchEvent>,
    reporter: Reporter,
    follow: Follow,
    watched: Option<String>,
}

enum LoopExit {
    Stopped(Option<StopReason>),
    Interrupted,
}

impl WatchLoop {
    async fn run(mut self) -> Result<i32, ExpectedError> {
        self.service.start_watching_report();
        if let Follow::Fixed(path) = self.follow.clone() {
            self.watch_test_case(path);
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let exit = loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => {
                    self.handle_event(event)?;
                }
                reason = self.service.wait_stopped() => {
                    break LoopExit::Stopped(reason);
                }
                res = &mut ctrl_c => {
                    res.map_err(|err| ExpectedError::SignalHandlerSetupFailed { err })?;
                    break LoopExit::Interrupted;
                }
            }
        };

        // Notifications sent before the service stopped are still queued.
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event)?;
        }

        let code = match exit {
            LoopExit::Stopped(Some(StopReason::Finished)) => {
                info!("loading finished");
                SailfishWatchExitCode::OK
            }
            LoopExit::Stopped(Some(StopReason::ConnectionError)) => {
                info!("stopped after a connection error");
                SailfishWatchExitCode::CONNECTION_ERROR
            }
            LoopExit::Stopped(None) => return Err(ExpectedError::ServiceExited),
            LoopExit::Interrupted => {
                info!("interrupted, stopping");
                SailfishWatchExitCode::OK
            }
        };

        self.service.shutdown().await;
        Ok(code)
    }

    fn handle_event(&mut self, event: WatchEvent) -> Result<(), ExpectedError> {
        self.reporter
            .write_event(&event, io::stdout().lock())
            .map_err(|err| ExpectedError::WriteFailed { err })?;

        if let WatchEvent::ReportUpdated { manifest, .. } = &event
            && self.follow == Follow::Live
            && let Some(path) = manifest
                .live_test_case()
                .and_then(|live| live.file_name.as_deref())
            && self.watched.as_deref() != Some(path)
        {
            self.watch_test_case(path.to_owned());
        }
        Ok(())
    }

    fn watch_test_case(&mut self, path: String) {
        debug!(%path, "watching test case");
        self.service.start_watching_test_case(path.clone());
        self.watched = Some(path);
    }
}
