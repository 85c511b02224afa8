// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session tokens for test-case watches.
//!
//! Every fragment fetch is issued on behalf of a [`SessionToken`]. Before a
//! fetch hands over its results it compares its token against the
//! [`ActiveSession`]; if the user has moved on to another test case in the
//! meantime, the results are dropped instead of applied.

use crate::manifest::Ordinal;
use std::fmt;
use tokio::sync::watch;

/// Identifies one watch of one test case.
///
/// The ordinal alone isn't enough: watching test case 3, then 4, then 3 again
/// must not let a late fetch from the first watch through, so each token also
/// carries a generation that is unique per watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionToken {
    ordinal: Ordinal,
    generation: u64,
}

impl SessionToken {
    /// The ordinal of the test case this session belongs to.
    pub fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    /// The generation of this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test case {} (session {})", self.ordinal, self.generation)
    }
}

/// The owner of the active session. Held by the coordinator.
#[derive(Debug)]
pub struct SessionTracker {
    sender: watch::Sender<Option<SessionToken>>,
    next_generation: u64,
}

impl SessionTracker {
    /// Creates a tracker with no active session.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            next_generation: 0,
        }
    }

    /// Makes a new session for `ordinal` the active one, returning its token.
    ///
    /// Any previously active session stops being current immediately.
    pub fn activate(&mut self, ordinal: Ordinal) -> SessionToken {
        let token = SessionToken {
            ordinal,
            generation: self.next_generation,
        };
        self.next_generation += 1;
        self.sender.send_replace(Some(token));
        token
    }

    /// Clears the active session.
    pub fn deactivate(&mut self) {
        self.sender.send_replace(None);
    }

    /// Returns the currently active session, if any.
    pub fn current(&self) -> Option<SessionToken> {
        *self.sender.borrow()
    }

    /// Returns a read handle onto the active session.
    pub fn active(&self) -> ActiveSession {
        ActiveSession {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A read handle onto the active session.
#[derive(Clone, Debug)]
pub struct ActiveSession {
    receiver: watch::Receiver<Option<SessionToken>>,
}

impl ActiveSession {
    /// Returns true if `token` is the active session.
    pub fn is_current(&self, token: SessionToken) -> bool {
        *self.receiver.borrow() == Some(token)
    }

    /// Returns the active session, if any.
    pub fn current(&self) -> Option<SessionToken> {
        *self.receiver.borrow()
    }
}
