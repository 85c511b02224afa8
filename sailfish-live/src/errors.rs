// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by sailfish-live.

use crate::manifest::Revision;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{borrow::Borrow, io};
use thiserror::Error;

/// An error produced by a single [`Transport`](crate::transport::Transport)
/// request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// A file backing the requested path couldn't be read.
    #[error("failed to read `{path}`")]
    Read {
        /// The path that was requested.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A fragment line couldn't be decoded.
    #[error("failed to decode line {line} of fragment `{path}`")]
    DecodeFragment {
        /// The fragment path.
        path: String,

        /// The 1-based line number.
        line: usize,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The request failed for a reason reported by the transport itself.
    #[error("request for `{path}` failed: {message}")]
    Request {
        /// The path that was requested.
        path: String,

        /// A description of the failure.
        message: String,
    },
}

impl TransportError {
    /// Creates a new [`TransportError::Request`].
    pub fn request(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// An error that occurred while fetching a manifest or a fragment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The fetch belonged to a session that is no longer active, or its guard
    /// was cancelled.
    ///
    /// This is never surfaced to listeners.
    #[error("fetch was cancelled")]
    Cancelled,

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A manifest was fetched but couldn't be parsed.
    #[error("failed to parse manifest `{path}`")]
    Manifest {
        /// The manifest path.
        path: String,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The fragment stream ended before the target revision arrived.
    #[error(
        "fragment `{path}` ended before revision {target} (last revision seen: {})",
        display_last_seen(.last_seen),
    )]
    IncompleteFragment {
        /// The fragment path.
        path: String,

        /// The revision that was expected.
        target: Revision,

        /// The highest revision that was received, if any.
        last_seen: Option<Revision>,
    },
}

impl FetchError {
    /// Returns true if this error represents a cancellation rather than a
    /// real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn display_last_seen(last_seen: impl Borrow<Option<Revision>>) -> String {
    match last_seen.borrow() {
        Some(revision) => revision.to_string(),
        None => "none".to_owned(),
    }
}

/// An error that occurred while parsing the live-update config.
#[derive(Debug, Error)]
#[error(
    "failed to parse live-update config{}",
    .config_file.as_ref().map(|file| format!(" at `{file}`")).unwrap_or_default(),
)]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self { config_file, kind }
    }

    /// Returns the config file that failed to parse, if any.
    pub fn config_file(&self) -> Option<&Utf8PathBuf> {
        self.config_file.as_ref()
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of [`ConfigParseError`] that occurred.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A poll interval was set to zero.
    #[error("`{key}` must be greater than zero")]
    ZeroPollInterval {
        /// The offending key.
        key: &'static str,
    },
}
