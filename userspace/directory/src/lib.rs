// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Directory client used by split devices to exchange handshake parameters
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (permissions, transactions, watches) + integration test (watch order)
//!
//! PUBLIC API:
//!   - Directory trait: read / write / remove / commit / watch, scoped to one domain
//!   - Transaction: batch of writes applied atomically
//!   - Watch / WatchEvent: ordered change notifications for a path and its children
//!   - HostStore: in-memory store with per-prefix ownership
//!
//! SECURITY INVARIANTS:
//!   - Any domain may read any node
//!   - A domain writes only below prefixes it owns (the control domain writes anywhere)
//!   - A transaction is applied entirely or not at all

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use std::str::FromStr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use thiserror::Error;

pub use nexus_grant::DomainId;

mod host;

pub use host::{DomainDirectory, HostStore};

/// Result alias for directory operations.
pub type Result<T> = core::result::Result<T, DirectoryError>;

/// Errors produced by directory operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The domain does not own the node it tried to modify.
    #[error("{domain} may not write {path}")]
    PermissionDenied {
        /// Domain attempting the write.
        domain: DomainId,
        /// Node involved.
        path: String,
    },
    /// Path is empty or has empty segments.
    #[error("invalid directory path {0:?}")]
    InvalidPath(String),
    /// A node expected by the caller does not exist.
    #[error("missing directory node {0}")]
    Missing(String),
    /// A node holds a value the caller cannot parse.
    #[error("malformed value {value:?} at {path}")]
    Malformed {
        /// Node involved.
        path: String,
        /// Raw value found.
        value: String,
    },
}

/// Joins a node path and a key.
pub fn join(base: &str, key: &str) -> String {
    format!("{base}/{key}")
}

/// Reads `path` and parses it, failing on absent or malformed values.
pub fn read_parsed<T: FromStr>(dir: &dyn Directory, path: &str) -> Result<T> {
    let value = dir.read(path)?.ok_or_else(|| DirectoryError::Missing(path.to_string()))?;
    value
        .trim()
        .parse()
        .map_err(|_| DirectoryError::Malformed { path: path.to_string(), value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TxnOp {
    Write(String, String),
    Remove(String),
}

/// Batch of modifications committed atomically with [`Directory::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    /// Starts an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write of `value` to `path`.
    pub fn write(&mut self, path: impl Into<String>, value: impl ToString) -> &mut Self {
        self.ops.push(TxnOp::Write(path.into(), value.to_string()));
        self
    }

    /// Queues removal of `path` and its children.
    pub fn remove(&mut self, path: impl Into<String>) -> &mut Self {
        self.ops.push(TxnOp::Remove(path.into()));
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Change notification for a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Node that changed.
    pub path: String,
    /// Its new value; `None` once removed.
    pub value: Option<String>,
}

/// Registered watch. Dropping it unregisters the watch.
pub struct Watch {
    path: String,
    rx: Receiver<WatchEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Watch {
    /// Wraps a receiver fed by a directory implementation.
    pub fn new(path: impl Into<String>, rx: Receiver<WatchEvent>, on_drop: Box<dyn FnOnce() + Send>) -> Self {
        Self { path: path.into(), rx, on_drop: Some(on_drop) }
    }

    /// Watched path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next pending event without blocking.
    pub fn try_next(&self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<WatchEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// All pending events, in delivery order.
    pub fn drain(&self) -> Vec<WatchEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Domain-scoped client of the shared directory.
pub trait Directory: Send + Sync {
    /// Domain this client acts as.
    fn domain(&self) -> DomainId;

    /// Reads a node.
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Creates or overwrites a node.
    fn write(&self, path: &str, value: &str) -> Result<()>;

    /// Removes a node and its children.
    fn remove(&self, path: &str) -> Result<()>;

    /// Applies every queued operation atomically.
    fn commit(&self, txn: Transaction) -> Result<()>;

    /// Watches `path` and its children. The current value is delivered first.
    fn watch(&self, path: &str) -> Result<Watch>;
}
