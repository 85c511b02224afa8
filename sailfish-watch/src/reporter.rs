// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Formats live-update notifications for the terminal.

use crate::output::StdoutStyles;
use owo_colors::OwoColorize;
use sailfish_live::{
    dispatch::{ConnectionError, ManifestUpdate, RecordUpdate},
    errors::FetchError,
    manifest::{FragmentCategory, Ordinal, ReportManifest, TestCaseManifest},
    record::Record,
};
use std::{error::Error, io, sync::Arc};

/// A notification forwarded from a listener callback to the watch loop.
#[derive(Debug)]
pub(crate) enum WatchEvent {
    Records {
        generation: u64,
        ordinal: Ordinal,
        category: FragmentCategory,
        records: Vec<Record>,
    },
    TestCaseUpdated {
        generation: u64,
        manifest: TestCaseManifest,
    },
    ReportUpdated {
        generation: u64,
        manifest: ReportManifest,
    },
    ReportFinished {
        generation: u64,
        manifest: ReportManifest,
    },
    ConnectionError {
        generation: u64,
        error: Arc<FetchError>,
    },
}

impl WatchEvent {
    pub(crate) fn records(update: RecordUpdate) -> Self {
        Self::Records {
            generation: update.generation.get(),
            ordinal: update.ordinal,
            category: update.category,
            records: update.records,
        }
    }

    pub(crate) fn test_case_updated(update: ManifestUpdate<TestCaseManifest>) -> Self {
        Self::TestCaseUpdated {
            generation: update.generation.get(),
            manifest: update.manifest,
        }
    }

    pub(crate) fn report_updated(update: ManifestUpdate<ReportManifest>) -> Self {
        Self::ReportUpdated {
            generation: update.generation.get(),
            manifest: update.manifest,
        }
    }

    pub(crate) fn report_finished(update: ManifestUpdate<ReportManifest>) -> Self {
        Self::ReportFinished {
            generation: update.generation.get(),
            manifest: update.manifest,
        }
    }

    pub(crate) fn connection_error(update: ConnectionError) -> Self {
        Self::ConnectionError {
            generation: update.generation.get(),
            error: update.error,
        }
    }
}

/// Writes one line per notification, plus one line per record in verbose
/// mode.
#[derive(Debug)]
pub(crate) struct Reporter {
    styles: StdoutStyles,
    verbose: bool,
}

impl Reporter {
    pub(crate) fn new(styles: StdoutStyles, verbose: bool) -> Self {
        Self { styles, verbose }
    }

    pub(crate) fn write_event(
        &self,
        event: &WatchEvent,
        mut writer: impl io::Write,
    ) -> io::Result<()> {
        let styles = &self.styles;
        match event {
            WatchEvent::Records {
                generation,
                ordinal,
                category,
                records,
            } => {
                self.write_generation(*generation, &mut writer)?;
                writeln!(
                    writer,
                    "{} {ordinal}: {} new {category} {}",
                    "test case".style(styles.heading),
                    records.len().style(styles.count),
                    plural(records.len(), "record", "records"),
                )?;
                if self.verbose {
                    for record in records {
                        writeln!(writer, "    {} {}", record.key, record.body)?;
                    }
                }
            }
            WatchEvent::TestCaseUpdated {
                generation,
                manifest,
            } => {
                self.write_generation(*generation, &mut writer)?;
                let status = if manifest.is_finished() {
                    "finished".style(styles.finished)
                } else {
                    "running".style(styles.heading)
                };
                let actions = manifest.files.count(&FragmentCategory::Action);
                let messages = manifest.files.count(&FragmentCategory::Message);
                writeln!(
                    writer,
                    "{} {} {status}: {} {}, {} {}",
                    "test case".style(styles.heading),
                    manifest.order,
                    actions.style(styles.count),
                    plural(actions, "action", "actions"),
                    messages.style(styles.count),
                    plural(messages, "message", "messages"),
                )?;
            }
            WatchEvent::ReportUpdated {
                generation,
                manifest,
            } => {
                self.write_generation(*generation, &mut writer)?;
                let test_cases = manifest.metadata.len();
                write!(
                    writer,
                    "{}: {} {}, ",
                    "report".style(styles.heading),
                    test_cases.style(styles.count),
                    plural(test_cases, "test case", "test cases"),
                )?;
                match manifest.live_test_case() {
                    Some(live) => writeln!(writer, "running `{}`", live.id)?,
                    None => writeln!(writer, "none running")?,
                }
            }
            WatchEvent::ReportFinished {
                generation,
                manifest,
            } => {
                self.write_generation(*generation, &mut writer)?;
                let test_cases = manifest.metadata.len();
                writeln!(
                    writer,
                    "{}: {} {}",
                    "report finished".style(styles.finished),
                    test_cases.style(styles.count),
                    plural(test_cases, "test case", "test cases"),
                )?;
            }
            WatchEvent::ConnectionError { generation, error } => {
                self.write_generation(*generation, &mut writer)?;
                write!(writer, "{}: {error}", "connection error".style(styles.error))?;
                let mut source = error.source();
                while let Some(err) = source {
                    write!(writer, ": {err}")?;
                    source = err.source();
                }
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    fn write_generation(&self, generation: u64, writer: &mut impl io::Write) -> io::Result<()> {
        write!(
            writer,
            "{} ",
            format!("[{generation:>4}]").style(self.styles.generation)
        )
    }
}

fn plural<N>(count: N, singular: &'static str, plural: &'static str) -> &'static str
where
    N: PartialEq + From<u8>,
{
    if count == N::from(1) { singular } else { plural }
}
