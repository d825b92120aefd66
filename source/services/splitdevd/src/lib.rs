// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host split-device daemon
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Integration tests (default run, backend-allocating class, config file)
//!
//! Wires both ends of one device onto a host bus, connects them, streams
//! numbered records from the producing side, closes from the backend and
//! reports what arrived and what was left allocated.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use std::fmt;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use splitdev::{
    Config, ConfigError, ConnState, DrainWorker, Endpoint, HostBus, HostPlatform, Message, Side,
};
use thiserror::Error;

/// How long one record may wait for a free ring slot.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the consumer may stay silent before records count as lost.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that stop a run.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Device or handshake failure.
    #[error(transparent)]
    Device(#[from] splitdev::Error),
    /// Unusable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The handshake settled without both sides connected.
    #[error("handshake did not connect (frontend {frontend}, backend {backend})")]
    NotConnected {
        /// Frontend state when the bus went quiet.
        frontend: ConnState,
        /// Backend state when the bus went quiet.
        backend: ConnState,
    },
    /// The consumer stopped draining.
    #[error("ring stayed full for {0:?}")]
    Stalled(Duration),
    /// The drain worker thread could not start.
    #[error("failed to start drain worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Records the consumer should have seen, greeting included.
    pub expected: usize,
    /// Records the consumer saw.
    pub received: usize,
    /// Grants still live after removal.
    pub live_grants: usize,
    /// Mappings still live after removal.
    pub live_mappings: usize,
    /// Event channel ports still open after removal, both domains.
    pub live_ports: usize,
}

impl Report {
    /// Every record arrived and nothing leaked.
    pub fn is_clean(&self) -> bool {
        self.received == self.expected && self.live_grants == 0 && self.live_mappings == 0 && self.live_ports == 0
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {}/{} records; live grants {}, mappings {}, ports {}",
            self.received, self.expected, self.live_grants, self.live_mappings, self.live_ports
        )
    }
}

fn send_with_backpressure(endpoint: &Endpoint, msg: &Message) -> Result<(), DaemonError> {
    let deadline = Instant::now() + SEND_TIMEOUT;
    loop {
        match endpoint.send(msg) {
            Ok(()) => return Ok(()),
            Err(splitdev::Error::Full(_)) if Instant::now() < deadline => thread::yield_now(),
            Err(splitdev::Error::Full(_)) => return Err(DaemonError::Stalled(SEND_TIMEOUT)),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Connects the configured device, sends `messages` records and tears it down.
pub fn run(config: &Config, messages: usize) -> Result<Report, DaemonError> {
    config.validate()?;
    let class = config.device_class()?;
    let bus = HostBus::new(HostPlatform::new(&config.limits));
    let (front, back) = bus.create_device(&class, config.frontend(), config.backend(), config.device.devid)?;

    let back_ep = bus.probe(&back)?;
    let front_ep = bus.probe(&front)?;
    let delivered = bus.pump();
    info!("handshake settled after {delivered} watch events");
    if front_ep.state() != ConnState::Connected || back_ep.state() != ConnState::Connected {
        return Err(DaemonError::NotConnected { frontend: front_ep.state(), backend: back_ep.state() });
    }

    let (producer, consumer) = match class.producer {
        Side::Backend => (&back_ep, &front_ep),
        Side::Frontend => (&front_ep, &back_ep),
    };
    let expected = messages + usize::from(class.greeting.is_some());
    let (tx, rx) = mpsc::channel();
    let worker = DrainWorker::spawn(consumer, tx)?;
    for n in 0..messages {
        let msg = Message::from_text(&format!("record {n}"))?;
        send_with_backpressure(producer, &msg)?;
    }
    let mut received = 0;
    while received < expected && rx.recv_timeout(RECV_TIMEOUT).is_ok() {
        received += 1;
    }
    worker.stop();
    if received < expected {
        warn!("only {received} of {expected} records arrived");
    }

    back_ep.close()?;
    bus.pump();
    for identity in [&front, &back] {
        match bus.remove(identity) {
            Ok(()) | Err(splitdev::Error::UnknownDevice(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let platform = bus.platform();
    Ok(Report {
        expected,
        received,
        live_grants: platform.grants().live_grants(),
        live_mappings: platform.grants().live_mappings(),
        live_ports: platform.events().live_ports(config.frontend()) + platform.events().live_ports(config.backend()),
    })
}
