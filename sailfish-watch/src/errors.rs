// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use sailfish_live::errors::ConfigParseError;
use std::{error::Error, io};
use thiserror::Error;
use tracing::error;

/// Documented exit codes for `sailfish-watch`.
///
/// Unknown or unexpected failures always result in exit code 1.
pub enum SailfishWatchExitCode {}

impl SailfishWatchExitCode {
    /// The report finished, or the user interrupted the watch.
    pub const OK: i32 = 0;

    /// Polling stopped because of a connection error.
    pub const CONNECTION_ERROR: i32 = 1;

    /// A user issue happened while setting up the watch.
    pub const SETUP_ERROR: i32 = 96;

    /// Writing data to stdout produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}

/// An error that `sailfish-watch` reports to the user before exiting.
#[derive(Debug, Error)]
pub enum ExpectedError {
    #[error("report directory not found")]
    ReportDirNotFound { path: Utf8PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("failed to create tokio runtime")]
    TokioRuntimeCreateFailed {
        #[source]
        err: io::Error,
    },
    #[error("failed to set up Ctrl-C handler")]
    SignalHandlerSetupFailed {
        #[source]
        err: io::Error,
    },
    #[error("failed to write to stdout")]
    WriteFailed {
        #[source]
        err: io::Error,
    },
    #[error("live-update service exited unexpectedly")]
    ServiceExited,
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ReportDirNotFound { .. }
            | Self::ConfigParseError { .. }
            | Self::SignalHandlerSetupFailed { .. } => SailfishWatchExitCode::SETUP_ERROR,
            Self::WriteFailed { .. } => SailfishWatchExitCode::WRITE_OUTPUT_ERROR,
            Self::TokioRuntimeCreateFailed { .. } | Self::ServiceExited => 1,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ReportDirNotFound { path } => {
                error!(
                    "report directory `{}` does not exist or is not a directory",
                    path.style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                match err.config_file() {
                    Some(file) => error!(
                        "failed to parse config file `{}`",
                        file.style(styles.bold)
                    ),
                    None => error!("failed to parse default config"),
                }
                Some(err.kind() as &dyn Error)
            }
            Self::TokioRuntimeCreateFailed { err } => {
                error!("failed to create tokio runtime");
                Some(err as &dyn Error)
            }
            Self::SignalHandlerSetupFailed { err } => {
                error!("failed to set up Ctrl-C handler");
                Some(err as &dyn Error)
            }
            Self::WriteFailed { err } => {
                error!("failed to write to stdout");
                Some(err as &dyn Error)
            }
            Self::ServiceExited => {
                error!("live-update service exited before reaching a stopped state");
                None
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
