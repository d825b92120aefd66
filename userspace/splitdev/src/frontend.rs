// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Frontend reaction table.
//!
//! The frontend takes at most one step per observed backend state, so its
//! reaction is a direct lookup rather than a walk.

use crate::state::ConnState;

/// What the frontend does for one observed backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Nothing to do.
    Ignore,
    /// Republish the given state.
    Publish(ConnState),
    /// Set up the transport, publish its parameters and go `Connected`.
    Connect,
    /// Backend confirmed the connection.
    PeerConnected,
    /// Tear the transport down and publish `Closing` then `Closed`.
    PeerClosed,
}

/// Reaction of a frontend in state `local` to the backend publishing `backend`.
pub fn react(local: ConnState, backend: ConnState) -> Reaction {
    use ConnState::*;

    match backend {
        Initialising => Reaction::Publish(Initialising),
        Initialised | Reconfiguring | Reconfigured | Unknown => Reaction::Ignore,
        InitWait if local == Initialising => Reaction::Connect,
        InitWait => Reaction::Ignore,
        Connected => Reaction::PeerConnected,
        // A backend seen as Closed without an observed Closing skipped that
        // state; both are handled the same unless already closed. A Closing
        // seen while Closed is a stale event, not a new close.
        Closing | Closed if local == Closed => Reaction::Ignore,
        Closing | Closed => Reaction::PeerClosed,
    }
}
