// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for the live-update service, mostly driven against a
//! scripted transport on a paused clock.

mod fixtures;
mod report_watch;
mod test_case_watch;
