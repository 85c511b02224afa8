// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Live-update core for Sailfish test reports.
//!
//! A Sailfish report is a static, file-like data source that is mutated in
//! place while a test run is executing. There is no push channel: this crate
//! polls the report manifest and the active test case's manifest, diffs their
//! file indexes against what has already been loaded, fetches only the missing
//! fragment revisions, and hands the decoded records to registered callbacks.
//!
//! The entry point is [`LiveUpdateService`](live::LiveUpdateService). The
//! building blocks it's made of ([`diff`], [`fetch`], [`guard`] and
//! [`dispatch`]) are public as well, so they can be driven directly.

pub mod config;
pub mod diff;
pub mod dispatch;
pub mod errors;
pub mod fetch;
pub mod guard;
pub mod live;
pub mod manifest;
pub mod record;
pub mod session;
pub mod transport;
