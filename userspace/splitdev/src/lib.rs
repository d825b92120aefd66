// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Split-device connection handshake and shared-ring transport
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (state codes, transition table, frontend table, config)
//!   + integration tests (handshake, closure, failures, removal)
//!
//! PUBLIC API:
//!   - Endpoint: one side of a device; on_activate / on_peer_state_changed / on_deactivate
//!   - DeviceClass / DeviceIdentity / Capabilities: explicit endpoint factory inputs
//!   - HostPlatform / HostBus: in-process host services and device model
//!   - DrainWorker: scheduled task draining a consumer ring
//!   - Config: TOML configuration
//!
//! SECURITY INVARIANTS:
//!   - Every transition is a tabulated edge or a typed protocol fault
//!   - Transport setup and teardown are serialised by the endpoint lock
//!   - Grants are never revoked while the peer maps them

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod bus;
pub mod config;
pub mod device;
pub mod drain;
pub mod endpoint;
mod error;
pub mod frontend;
pub mod record;
pub mod state;
pub mod table;
mod transport;

pub use bus::{HostBus, HostPlatform};
pub use config::{Config, ConfigError, Limits};
pub use device::{Capabilities, DeviceClass, DeviceIdentity, Side};
pub use drain::DrainWorker;
pub use endpoint::{Disposition, Endpoint};
pub use error::{Error, Result};
pub use record::{Message, MESSAGE_SIZE};
pub use state::{ConnState, PeerState};
pub use table::{EdgeAction, Fault};
pub use transport::{EVENT_CHANNEL_KEY, RING_REF_KEY};
