// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device identity, device class and the capabilities an endpoint runs with.

use core::fmt;
use std::sync::Arc;

use nexus_directory::Directory;
use nexus_evtchn::EventChannel;
use nexus_grant::{DomainId, GrantTable};
use serde::Deserialize;

use crate::record::Message;

/// Role of one end of a split device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Guest-facing half, probed under `device/`.
    Frontend,
    /// Service half, probed under `backend/`.
    Backend,
}

impl Side {
    /// The other role.
    pub fn other(self) -> Side {
        match self {
            Side::Frontend => Side::Backend,
            Side::Backend => Side::Frontend,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Frontend => "frontend",
            Side::Backend => "backend",
        })
    }
}

/// Per-class transport roles. Which side allocates the ring and which side
/// produces on it are fixed per class, never negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceClass {
    /// Class name used in directory paths.
    pub name: String,
    /// Side that allocates, formats and grants the ring page.
    pub allocator: Side,
    /// Side that produces records on the ring.
    pub producer: Side,
    /// Record the producer sends once connected.
    pub greeting: Option<Message>,
}

impl DeviceClass {
    /// Class where the frontend grants the ring and the backend writes to it.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), allocator: Side::Frontend, producer: Side::Backend, greeting: None }
    }

    /// Sets the allocating side.
    pub fn with_allocator(mut self, side: Side) -> Self {
        self.allocator = side;
        self
    }

    /// Sets the producing side.
    pub fn with_producer(mut self, side: Side) -> Self {
        self.producer = side;
        self
    }

    /// Sets the greeting record.
    pub fn with_greeting(mut self, greeting: Message) -> Self {
        self.greeting = Some(greeting);
        self
    }
}

/// Where one end of a device lives in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device class name.
    pub class: String,
    /// Role of this end.
    pub side: Side,
    /// Domain running this end.
    pub domid: DomainId,
    /// Device number within the class.
    pub devid: u32,
    /// Own directory node.
    pub nodename: String,
    /// Peer's directory node.
    pub otherend: String,
    /// Domain running the peer.
    pub otherend_id: DomainId,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nodename)
    }
}

/// Domain-scoped services handed to an endpoint by its factory.
#[derive(Clone)]
pub struct Capabilities {
    /// Grant table view of the endpoint's domain.
    pub grants: Arc<dyn GrantTable>,
    /// Event channel view of the endpoint's domain.
    pub events: Arc<dyn EventChannel>,
    /// Directory client of the endpoint's domain.
    pub directory: Arc<dyn Directory>,
}
