// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One side's live connection object
//!
//! OWNERS: @runtime
//!
//! An [`Endpoint`] is built by [`Endpoint::new`] from an identity, a device
//! class and the domain-scoped capabilities it may use. Directory watch events
//! enter through [`Endpoint::on_peer_state_changed`]; ring traffic goes
//! through [`Endpoint::send`] and [`Endpoint::drain`]. Both paths take the
//! same per-endpoint lock, so transport setup and teardown never race a
//! transition.
//!
//! SECURITY INVARIANTS:
//!   - A side only writes its own node and only reads the peer's `state` as input
//!   - A protocol violation freezes the endpoint; only deactivation still acts
//!   - A granted page outlives its transport until the peer's teardown has run

use std::sync::Arc;

use log::{debug, error, info, warn};
use nexus_directory::{join, Transaction};
use nexus_evtchn::Latch;
use nexus_grant::GrantRef;
use parking_lot::Mutex;

use crate::device::{Capabilities, DeviceClass, DeviceIdentity, Side};
use crate::error::{Error, Result};
use crate::frontend::{self, Reaction};
use crate::record::Message;
use crate::state::{ConnState, PeerState};
use crate::table::{self, Edge, EdgeAction, Fault};
use crate::transport::{self, Transport};

/// Key holding a side's published state.
pub const STATE_KEY: &str = "state";
/// Key holding the last device error of a side.
pub const ERROR_KEY: &str = "error";
/// Key the toolstack sets to `"1"` while a backend device is wanted.
pub const ONLINE_KEY: &str = "online";

/// What the host bus should do with the device after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the endpoint bound.
    Keep,
    /// The device is gone; remove the endpoint.
    Unregister,
}

struct EndpointInner {
    state: ConnState,
    peer: Option<PeerState>,
    peer_seen: bool,
    fault: Option<Fault>,
    transport: Option<Transport>,
    /// Grant outliving its transport until the peer has unmapped it.
    held: Option<GrantRef>,
}

/// One side of a split device.
pub struct Endpoint {
    identity: DeviceIdentity,
    class: DeviceClass,
    caps: Capabilities,
    latch: Arc<Latch>,
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    /// Creates an inactive endpoint; nothing is published until [`Endpoint::on_activate`].
    pub fn new(identity: DeviceIdentity, class: DeviceClass, caps: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            identity,
            class,
            caps,
            latch: Latch::new(),
            inner: Mutex::new(EndpointInner {
                state: ConnState::Unknown,
                peer: None,
                peer_seen: false,
                fault: None,
                transport: None,
                held: None,
            }),
        })
    }

    /// Where this endpoint lives.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Transport roles of the device class.
    pub fn class(&self) -> &DeviceClass {
        &self.class
    }

    /// Data-ready latch set by the notification handler.
    pub fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.latch)
    }

    /// Local state.
    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Last observed peer state.
    pub fn peer_state(&self) -> Option<PeerState> {
        self.inner.lock().peer.clone()
    }

    /// Protocol fault that froze the endpoint, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.inner.lock().fault
    }

    /// Whether a transport is up.
    pub fn has_transport(&self) -> bool {
        self.inner.lock().transport.is_some()
    }

    /// Publishes `Initialising`.
    pub fn on_activate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.publish(&mut inner, ConnState::Initialising)
    }

    /// Feeds one observation of the peer's `state` node.
    pub fn on_peer_state_changed(&self, peer: PeerState) -> Disposition {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.peer.as_ref() == Some(&peer) {
            debug!("{}: peer still {peer}", self.identity);
            return Disposition::Keep;
        }
        let was_seen = inner.peer_seen;
        inner.peer_seen |= !matches!(peer, PeerState::Known(ConnState::Unknown));
        inner.peer = Some(peer.clone());
        if let Some(fault) = inner.fault {
            warn!("{}: frozen after {fault}, ignoring peer {peer}", self.identity);
            return Disposition::Keep;
        }
        debug!("{}: peer is {peer}, local {}", self.identity, inner.state);
        match self.identity.side {
            Side::Backend => self.backend_changed(inner, peer, was_seen),
            Side::Frontend => {
                self.frontend_changed(inner, peer);
                Disposition::Keep
            }
        }
    }

    /// Drives the teardown edges before the endpoint is dropped.
    pub fn on_deactivate(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.fault.is_some() {
            self.release_transport(inner);
            if let Err(err) = self.publish(inner, ConnState::Closed) {
                warn!("{}: {err}", self.identity);
            }
            return;
        }
        if !matches!(inner.state, ConnState::Unknown | ConnState::Closed) {
            match self.identity.side {
                Side::Backend => {
                    if let Err(err) = self.walk(inner, ConnState::Closed) {
                        debug!("{}: close walk on deactivation stopped: {err}", self.identity);
                    }
                }
                Side::Frontend => self.peer_closed(inner),
            }
        }
        self.release_transport(inner);
    }

    /// Starts an orderly close from this side.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.fault.is_some() {
            return Err(Error::Frozen);
        }
        match self.identity.side {
            Side::Backend => self.walk(inner, ConnState::Closing),
            Side::Frontend => match inner.state {
                ConnState::Unknown | ConnState::Closing | ConnState::Closed => Ok(()),
                _ => {
                    self.disconnect_transport(inner);
                    self.publish(inner, ConnState::Closing)
                }
            },
        }
    }

    /// Produces `msg` on the ring and notifies the peer.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fault.is_some() {
            return Err(Error::Frozen);
        }
        if inner.state != ConnState::Connected {
            return Err(Error::NotConnected);
        }
        inner.transport.as_mut().ok_or(Error::NotConnected)?.send(&self.caps, msg)
    }

    /// Consumes every record currently on the ring.
    pub fn drain(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        match inner.transport.as_mut() {
            Some(transport) => transport.drain(&self.identity),
            None => Vec::new(),
        }
    }

    fn allocates(&self) -> bool {
        self.class.allocator == self.identity.side
    }

    fn is_online(&self) -> bool {
        match self.caps.directory.read(&join(&self.identity.nodename, ONLINE_KEY)) {
            Ok(value) => value.as_deref().map(str::trim) == Some("1"),
            Err(err) => {
                warn!("{}: cannot read {ONLINE_KEY}: {err}", self.identity);
                false
            }
        }
    }

    fn backend_changed(&self, inner: &mut EndpointInner, peer: PeerState, was_seen: bool) -> Disposition {
        use ConnState::*;

        let target = match peer {
            PeerState::Known(Initialising) => InitWait,
            PeerState::Known(Connected) => Connected,
            PeerState::Known(Closing) => Closing,
            PeerState::Known(Closed) => Closed,
            PeerState::Known(Initialised) => return Disposition::Keep,
            PeerState::Known(Unknown) if !was_seen => return Disposition::Keep,
            PeerState::Known(Unknown) => {
                info!("{}: frontend vanished", self.identity);
                return match self.walk(inner, Closed) {
                    Ok(()) => Disposition::Unregister,
                    Err(_) => Disposition::Keep,
                };
            }
            PeerState::Known(other @ (InitWait | Reconfiguring | Reconfigured)) => {
                self.report(&self.unexpected_peer(other.code().to_string()));
                return Disposition::Keep;
            }
            PeerState::Unrecognized(raw) => {
                self.report(&self.unexpected_peer(raw));
                return Disposition::Keep;
            }
        };
        if self.walk(inner, target).is_err() {
            return Disposition::Keep;
        }
        if target == Closed && !self.is_online() {
            info!("{}: closed and offline", self.identity);
            return Disposition::Unregister;
        }
        Disposition::Keep
    }

    fn unexpected_peer(&self, value: String) -> Error {
        Error::InvalidValue { path: join(&self.identity.otherend, STATE_KEY), value }
    }

    fn frontend_changed(&self, inner: &mut EndpointInner, peer: PeerState) {
        let backend = match peer {
            PeerState::Known(state) => state,
            PeerState::Unrecognized(raw) => {
                warn!("{}: backend published unrecognized state {raw:?}", self.identity);
                return;
            }
        };
        match frontend::react(inner.state, backend) {
            Reaction::Ignore => {}
            Reaction::Publish(state) => {
                self.release_transport(inner);
                if let Err(err) = self.publish(inner, state) {
                    self.report(&err);
                }
            }
            Reaction::Connect => {
                if let Err(err) = self.frontend_connect(inner) {
                    self.report(&err);
                }
            }
            Reaction::PeerConnected => info!("{}: backend connected", self.identity),
            Reaction::PeerClosed => self.peer_closed(inner),
        }
    }

    fn frontend_connect(&self, inner: &mut EndpointInner) -> Result<()> {
        let transport = if self.allocates() {
            let transport = Transport::allocate(&self.identity, &self.class, &self.caps, &self.latch)?;
            let mut txn = Transaction::new();
            transport.publish(&self.identity, &mut txn);
            if let Err(err) = self.caps.directory.commit(txn) {
                self.roll_back(transport);
                return Err(err.into());
            }
            transport
        } else {
            Transport::map(&self.identity, &self.class, &self.caps, &self.latch)?
        };
        inner.transport = Some(transport);
        if let Err(err) = self.publish(inner, ConnState::Connected) {
            self.release_transport(inner);
            return Err(err);
        }
        self.on_connected(inner);
        Ok(())
    }

    fn peer_closed(&self, inner: &mut EndpointInner) {
        self.release_transport(inner);
        for state in [ConnState::Closing, ConnState::Closed] {
            if inner.state == state {
                continue;
            }
            if let Err(err) = self.publish(inner, state) {
                self.report(&err);
            }
        }
    }

    /// Walks the backend table to `target`. Failures are reported before returning.
    fn walk(&self, inner: &mut EndpointInner, target: ConnState) -> Result<()> {
        let edges = match table::plan(inner.state, target) {
            Ok(edges) => edges,
            Err(fault) => {
                self.freeze(inner, fault);
                return Err(fault.into());
            }
        };
        for edge in edges {
            if let Err(err) = self.apply(inner, edge) {
                self.report(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    fn apply(&self, inner: &mut EndpointInner, edge: Edge) -> Result<()> {
        match edge.action {
            EdgeAction::ConnectSetup => {
                if inner.transport.is_none() {
                    if self.allocates() {
                        return Err(Error::NotConnected);
                    }
                    let transport = Transport::map(&self.identity, &self.class, &self.caps, &self.latch)?;
                    inner.transport = Some(transport);
                }
                if let Err(err) = self.publish(inner, edge.to) {
                    self.release_transport(inner);
                    return Err(err);
                }
                self.on_connected(inner);
                Ok(())
            }
            EdgeAction::ConnectTeardown => {
                self.disconnect_transport(inner);
                self.publish(inner, edge.to)
            }
            EdgeAction::Publish if edge.to == ConnState::InitWait && self.allocates() => {
                self.release_transport(inner);
                let transport = Transport::allocate(&self.identity, &self.class, &self.caps, &self.latch)?;
                let mut txn = Transaction::new();
                transport.publish(&self.identity, &mut txn);
                txn.write(join(&self.identity.nodename, STATE_KEY), edge.to.code());
                if let Err(err) = self.caps.directory.commit(txn) {
                    self.roll_back(transport);
                    return Err(err.into());
                }
                info!("{}: state {} -> {}", self.identity, inner.state, edge.to);
                inner.state = edge.to;
                inner.transport = Some(transport);
                Ok(())
            }
            EdgeAction::Publish => {
                match edge.to {
                    ConnState::Closing => self.disconnect_transport(inner),
                    ConnState::Closed => self.release_transport(inner),
                    _ => {}
                }
                self.publish(inner, edge.to)
            }
        }
    }

    fn on_connected(&self, inner: &mut EndpointInner) {
        let Some(transport) = inner.transport.as_mut() else {
            return;
        };
        if transport.is_consumer() {
            // Records may have been produced before our handler was bound.
            self.latch.set();
        }
        if self.class.producer != self.identity.side {
            return;
        }
        if let Some(greeting) = &self.class.greeting {
            match transport.send(&self.caps, greeting) {
                Ok(()) => debug!("{}: sent greeting", self.identity),
                Err(err) => self.report(&err),
            }
        }
    }

    /// Drops the transport but keeps a granted page until the peer has unmapped it.
    fn disconnect_transport(&self, inner: &mut EndpointInner) {
        if let Some(transport) = inner.transport.take() {
            if let Some(gref) = transport.disconnect(&self.identity, &self.caps) {
                debug!("{}: holding grant {gref} until the peer unmaps", self.identity);
                inner.held = Some(gref);
            }
        }
    }

    fn release_transport(&self, inner: &mut EndpointInner) {
        self.disconnect_transport(inner);
        if let Some(gref) = inner.held.take() {
            if let Some(err) = transport::revoke(&self.identity, &self.caps, gref) {
                self.report(&err);
            }
        }
    }

    fn roll_back(&self, transport: Transport) {
        if let Some(err) = transport.teardown(&self.identity, &self.caps) {
            self.report(&err);
        }
    }

    fn publish(&self, inner: &mut EndpointInner, state: ConnState) -> Result<()> {
        self.caps
            .directory
            .write(&join(&self.identity.nodename, STATE_KEY), &state.code().to_string())?;
        info!("{}: state {} -> {}", self.identity, inner.state, state);
        inner.state = state;
        Ok(())
    }

    fn freeze(&self, inner: &mut EndpointInner, fault: Fault) {
        error!("{}: protocol violation, endpoint frozen", self.identity);
        inner.fault = Some(fault);
        self.report(&Error::Protocol(fault));
    }

    fn report(&self, err: &Error) {
        error!("{}: {err}", self.identity);
        let value = format!("{}: {err}", err.kind());
        if let Err(write) = self.caps.directory.write(&join(&self.identity.nodename, ERROR_KEY), &value) {
            warn!("{}: cannot record device error: {write}", self.identity);
        }
    }
}
