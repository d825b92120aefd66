// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connection state vocabulary shared by both sides of a split device.

use core::fmt;

/// State each side publishes under its own `state` key.
///
/// The discriminants are the numeric codes written to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// No state published yet.
    Unknown = 0,
    /// Probed, setting up.
    Initialising = 1,
    /// Waiting for the peer's parameters.
    InitWait = 2,
    /// Parameters published, waiting for the peer to connect.
    Initialised = 3,
    /// Transport up.
    Connected = 4,
    /// Shutting down.
    Closing = 5,
    /// Shut down.
    Closed = 6,
    /// Renegotiation requested.
    Reconfiguring = 7,
    /// Renegotiation done.
    Reconfigured = 8,
}

impl ConnState {
    /// Every state, in code order.
    pub const ALL: [ConnState; 9] = [
        ConnState::Unknown,
        ConnState::Initialising,
        ConnState::InitWait,
        ConnState::Initialised,
        ConnState::Connected,
        ConnState::Closing,
        ConnState::Closed,
        ConnState::Reconfiguring,
        ConnState::Reconfigured,
    ];

    /// Numeric code as published.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// State for a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Unknown => "Unknown",
            ConnState::Initialising => "Initialising",
            ConnState::InitWait => "InitWait",
            ConnState::Initialised => "Initialised",
            ConnState::Connected => "Connected",
            ConnState::Closing => "Closing",
            ConnState::Closed => "Closed",
            ConnState::Reconfiguring => "Reconfiguring",
            ConnState::Reconfigured => "Reconfigured",
        };
        f.write_str(name)
    }
}

/// Peer state as read from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// A valid state code.
    Known(ConnState),
    /// Anything that does not parse as a state code.
    Unrecognized(String),
}

impl PeerState {
    /// Interprets a raw `state` node. A missing node reads as [`ConnState::Unknown`].
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return PeerState::Known(ConnState::Unknown);
        };
        match raw.trim().parse::<u8>().ok().and_then(ConnState::from_code) {
            Some(state) => PeerState::Known(state),
            None => PeerState::Unrecognized(raw.to_string()),
        }
    }
}

impl From<ConnState> for PeerState {
    fn from(state: ConnState) -> Self {
        PeerState::Known(state)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Known(state) => state.fmt(f),
            PeerState::Unrecognized(raw) => write!(f, "unrecognized({raw:?})"),
        }
    }
}
