// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use nexus_directory::DirectoryError;
use nexus_evtchn::EvtchnError;
use nexus_grant::GrantError;
use nexus_ring::{Full, RingError};
use thiserror::Error;

use crate::table::Fault;

/// Result alias for split-device operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by endpoints and the host bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Grant table failure.
    #[error(transparent)]
    Grant(#[from] GrantError),
    /// Event channel failure.
    #[error(transparent)]
    Evtchn(#[from] EvtchnError),
    /// Directory failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Shared ring rejected the page.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// No free slot on the ring.
    #[error("ring full")]
    Full(#[from] Full),
    /// The peer has not published a required key.
    #[error("peer did not publish {0}")]
    MissingKey(String),
    /// The peer published a value that cannot be used.
    #[error("invalid value {value:?} at {path}")]
    InvalidValue {
        /// Node involved.
        path: String,
        /// Raw value found.
        value: String,
    },
    /// The peer violated the handshake order.
    #[error("protocol violation: {0}")]
    Protocol(#[from] Fault),
    /// The endpoint stopped after a protocol violation.
    #[error("endpoint frozen after protocol violation")]
    Frozen,
    /// No transport is up.
    #[error("not connected")]
    NotConnected,
    /// This side only consumes from the ring.
    #[error("this side does not produce on the ring")]
    NotProducer,
    /// Text does not fit in one message record.
    #[error("message of {0} bytes does not fit in a record")]
    MessageTooLong(usize),
    /// No device with this node is known to the bus.
    #[error("unknown device {0}")]
    UnknownDevice(String),
    /// The device already has a live endpoint.
    #[error("device {0} already probed")]
    AlreadyProbed(String),
}

impl Error {
    /// Errno-like tag written in front of device errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Grant(GrantError::NoMemory) => "ENOMEM",
            Error::Grant(GrantError::Exhausted(_)) | Error::Evtchn(EvtchnError::Exhausted(_)) => "ENOSPC",
            Error::Grant(GrantError::StillMapped { .. }) | Error::Evtchn(EvtchnError::HandlerAlreadyBound(_)) => {
                "EBUSY"
            }
            Error::Grant(GrantError::PermissionDenied { .. })
            | Error::Evtchn(EvtchnError::PermissionDenied { .. })
            | Error::Directory(DirectoryError::PermissionDenied { .. }) => "EACCES",
            Error::Grant(GrantError::NotFound { .. } | GrantError::UnknownMapping)
            | Error::Directory(DirectoryError::Missing(_))
            | Error::MissingKey(_) => "ENOENT",
            Error::Full(_) => "EAGAIN",
            Error::Protocol(_) | Error::Frozen => "EPROTO",
            Error::NotConnected => "ENOTCONN",
            Error::MessageTooLong(_) => "EMSGSIZE",
            Error::UnknownDevice(_) => "ENODEV",
            Error::AlreadyProbed(_) => "EEXIST",
            Error::Evtchn(EvtchnError::InvalidPort(_))
            | Error::Directory(_)
            | Error::Ring(_)
            | Error::InvalidValue { .. }
            | Error::NotProducer => "EINVAL",
        }
    }
}

impl Error {
    pub(crate) fn from_read(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Missing(path) => Error::MissingKey(path),
            DirectoryError::Malformed { path, value } => Error::InvalidValue { path, value },
            other => Error::Directory(other),
        }
    }
}
