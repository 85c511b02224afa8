// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the live-update service.
//!
//! The configuration is read from an embedded default config, with an
//! optional user-provided TOML file layered on top of it.

mod retry_policy;

pub use retry_policy::RetryPolicy;

use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use camino::Utf8Path;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use retry_policy::deserialize_retry_policy;
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use tracing::warn;

/// Configuration for a [`LiveUpdateService`](crate::live::LiveUpdateService).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveUpdateConfig {
    /// Path of the report manifest, relative to the transport root.
    pub report_path: String,

    /// How often the report manifest is polled.
    pub report_poll_interval: Duration,

    /// How often the watched test case's manifest is polled.
    pub test_case_poll_interval: Duration,

    /// Whether log entries are fetched from the start.
    pub watch_logs: bool,

    /// How fragment fetches are retried.
    pub fragment_retries: RetryPolicy,
}

impl Default for LiveUpdateConfig {
    fn default() -> Self {
        Self {
            report_path: "report.json".to_owned(),
            report_poll_interval: Self::DEFAULT_POLL_INTERVAL,
            test_case_poll_interval: Self::DEFAULT_POLL_INTERVAL,
            watch_logs: false,
            fragment_retries: RetryPolicy::default(),
        }
    }
}

impl LiveUpdateConfig {
    /// The default config, embedded into the library.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The default interval between polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

    /// Reads the config, layering `file` (if any) over the default config.
    ///
    /// Unknown keys are reported as warnings.
    pub fn from_sources(file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(file, &mut DefaultConfigWarnings)
    }

    fn from_sources_with_warnings(
        file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();
        if let Some(file) = file {
            builder = builder.add_source(File::new(file.as_str(), FileFormat::Toml));
        }
        Self::build(builder, file, warnings)
    }

    /// Parses a config from TOML contents layered over the default config.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigParseError> {
        Self::from_toml_str_with_warnings(contents, &mut DefaultConfigWarnings)
    }

    fn from_toml_str_with_warnings(
        contents: &str,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(contents, FileFormat::Toml));
        Self::build(builder, None, warnings)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build(
        builder: ConfigBuilder<DefaultState>,
        file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(file.map(ToOwned::to_owned), kind))?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(file, &unknown);
        }

        config
            .into_config()
            .map_err(|kind| ConfigParseError::new(file.map(ToOwned::to_owned), kind))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(LiveUpdateConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: LiveUpdateConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the
                // key. Drop the key from the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LiveUpdateConfigDeserialize {
    report_path: String,
    #[serde(with = "humantime_serde")]
    report_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    test_case_poll_interval: Duration,
    watch_logs: bool,
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    fragment_retries: RetryPolicy,
}

impl LiveUpdateConfigDeserialize {
    fn into_config(self) -> Result<LiveUpdateConfig, ConfigParseErrorKind> {
        if self.report_poll_interval.is_zero() {
            return Err(ConfigParseErrorKind::ZeroPollInterval {
                key: "report-poll-interval",
            });
        }
        if self.test_case_poll_interval.is_zero() {
            return Err(ConfigParseErrorKind::ZeroPollInterval {
                key: "test-case-poll-interval",
            });
        }

        Ok(LiveUpdateConfig {
            report_path: self.report_path,
            report_poll_interval: self.report_poll_interval,
            test_case_poll_interval: self.test_case_poll_interval,
            watch_logs: self.watch_logs,
            fragment_retries: self.fragment_retries,
        })
    }
}

/// Handling for warnings produced while reading the config.
trait ConfigWarnings {
    /// Handle unknown configuration keys.
    fn unknown_config_keys(&mut self, config_file: Option<&Utf8Path>, unknown: &BTreeSet<String>);
}

/// Logs warnings using the tracing crate.
struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: Option<&Utf8Path>, unknown: &BTreeSet<String>) {
        let mut unknown_str = String::new();
        if let [single] = unknown.iter().collect::<Vec<_>>()[..] {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.push_str(single);
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        match config_file {
            Some(config_file) => warn!(
                "in config file {config_file}, ignoring unknown configuration {unknown_str}"
            ),
            None => warn!("ignoring unknown configuration {unknown_str}"),
        }
    }
}
