// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Edge-triggered notification channels between two domains
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (binding, coalescing, teardown, latch)
//!
//! PUBLIC API:
//!   - EventChannel trait: allocate / bind_remote / bind_handler / signal / free
//!   - HostEventChannels: in-process port table for host builds and tests
//!   - Latch: data-ready flag set from a handler, consumed by a scheduled task
//!
//! A signal is fire-and-forget. Several signals raised before the handler runs
//! may be observed as one; consumers must treat a notification as a hint that
//! new data may exist, never as a count.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use core::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use nexus_grant::DomainId;

mod host;
mod latch;

pub use host::{DomainEvents, HostEventChannels};
pub use latch::Latch;

/// Port number local to the domain that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalPort(pub u32);

impl fmt::Display for LocalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Port number as published by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePort(pub u32);

impl From<LocalPort> for RemotePort {
    fn from(port: LocalPort) -> Self {
        Self(port.0)
    }
}

/// Established inter-domain binding, as seen from the binding side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Freshly allocated local end.
    pub local: LocalPort,
    /// Domain at the other end.
    pub remote_domain: DomainId,
    /// Port the peer allocated.
    pub remote_port: RemotePort,
}

/// Callback run when the peer signals a port.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

/// Result alias for notification channel operations.
pub type Result<T> = core::result::Result<T, EvtchnError>;

/// Errors produced by the notification channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvtchnError {
    /// The domain has no free ports left.
    #[error("no free event channel ports in {0}")]
    Exhausted(DomainId),
    /// The port is not open in the calling domain.
    #[error("port {0} is not open")]
    InvalidPort(LocalPort),
    /// The remote port is not an unbound port reserved for the caller.
    #[error("{caller} may not bind to port {port} of {remote}")]
    PermissionDenied {
        /// Domain attempting the bind.
        caller: DomainId,
        /// Domain owning the target port.
        remote: DomainId,
        /// Target port.
        port: u32,
    },
    /// A handler is already bound to the port.
    #[error("port {0} already has a handler")]
    HandlerAlreadyBound(LocalPort),
}

/// Domain-scoped notification channel primitive.
pub trait EventChannel: Send + Sync {
    /// Domain this view acts as.
    fn domain(&self) -> DomainId;

    /// Allocates an unbound port that `remote` may later bind to.
    fn allocate(&self, remote: DomainId) -> Result<LocalPort>;

    /// Binds a new local port to the unbound `remote_port` of `remote`.
    fn bind_remote(&self, remote: DomainId, remote_port: RemotePort) -> Result<Binding>;

    /// Installs the single handler run when the peer signals `port`.
    fn bind_handler(&self, port: LocalPort, handler: Handler) -> Result<()>;

    /// Notifies the peer end of `port`.
    fn signal(&self, port: LocalPort) -> Result<()>;

    /// Closes `port` and drops its handler.
    fn free(&self, port: LocalPort) -> Result<()>;
}
