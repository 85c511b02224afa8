// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The live-update service.
//!
//! The main structure in this module is [`LiveUpdateService`].

mod coordinator;
mod imp;
mod internal_events;

pub use imp::*;
