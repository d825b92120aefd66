// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process event channel table emulating the hypervisor for host builds
//!
//! OWNERS: @runtime
//!
//! Handlers run on the signalling thread, after the table lock is released, the
//! way an upcall would preempt the receiving domain. Handlers are expected to do
//! no more than mark work pending.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{Binding, DomainId, EventChannel, EvtchnError, Handler, LocalPort, RemotePort, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PortState {
    /// Reserved for `remote`, waiting for it to bind.
    Unbound { remote: DomainId },
    /// Connected to `port` in `remote`.
    Interdomain { remote: DomainId, port: u32 },
}

struct Port {
    state: PortState,
    handler: Option<Handler>,
    pending: bool,
}

#[derive(Default)]
struct TableInner {
    ports: BTreeMap<(DomainId, u32), Port>,
    fail_allocate: bool,
}

impl TableInner {
    fn open_ports(&self, domain: DomainId) -> usize {
        self.ports.keys().filter(|(dom, _)| *dom == domain).count()
    }

    fn lowest_free(&self, domain: DomainId) -> u32 {
        (1..).find(|port| !self.ports.contains_key(&(domain, *port))).unwrap_or(u32::MAX)
    }

    fn insert(&mut self, domain: DomainId, state: PortState) -> LocalPort {
        let port = self.lowest_free(domain);
        self.ports.insert((domain, port), Port { state, handler: None, pending: false });
        LocalPort(port)
    }
}

/// Event channel table shared by all domains of one host.
pub struct HostEventChannels {
    limit: usize,
    inner: Mutex<TableInner>,
}

impl HostEventChannels {
    /// Creates a table allowing `limit` open ports per domain.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self { limit, inner: Mutex::new(TableInner::default()) })
    }

    /// Returns the view through which `domain` uses the table.
    pub fn for_domain(self: &Arc<Self>, domain: DomainId) -> DomainEvents {
        DomainEvents { table: Arc::clone(self), domain }
    }

    /// Number of ports currently open in `domain`.
    pub fn live_ports(&self, domain: DomainId) -> usize {
        self.inner.lock().open_ports(domain)
    }

    /// Makes the next `allocate` or `bind_remote` fail as if the domain were out of ports.
    pub fn fail_next_allocate(&self) {
        self.inner.lock().fail_allocate = true;
    }

    fn reserve(&self, inner: &mut TableInner, domain: DomainId) -> Result<()> {
        if std::mem::take(&mut inner.fail_allocate) || inner.open_ports(domain) >= self.limit {
            return Err(EvtchnError::Exhausted(domain));
        }
        Ok(())
    }

    fn allocate(&self, domain: DomainId, remote: DomainId) -> Result<LocalPort> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, domain)?;
        let port = inner.insert(domain, PortState::Unbound { remote });
        debug!("{domain} allocated unbound port {port} for {remote}");
        Ok(port)
    }

    fn bind_remote(&self, domain: DomainId, remote: DomainId, remote_port: RemotePort) -> Result<Binding> {
        let mut inner = self.inner.lock();
        let denied = EvtchnError::PermissionDenied { caller: domain, remote, port: remote_port.0 };
        match inner.ports.get(&(remote, remote_port.0)) {
            Some(Port { state: PortState::Unbound { remote: reserved }, .. }) if *reserved == domain => {}
            _ => return Err(denied),
        }
        self.reserve(&mut inner, domain)?;
        let local = inner.insert(domain, PortState::Interdomain { remote, port: remote_port.0 });
        if let Some(peer) = inner.ports.get_mut(&(remote, remote_port.0)) {
            peer.state = PortState::Interdomain { remote: domain, port: local.0 };
        }
        debug!("{domain} bound port {local} to {remote}:{}", remote_port.0);
        Ok(Binding { local, remote_domain: remote, remote_port })
    }

    fn bind_handler(&self, domain: DomainId, port: LocalPort, handler: Handler) -> Result<()> {
        let fire = {
            let mut inner = self.inner.lock();
            let entry = inner.ports.get_mut(&(domain, port.0)).ok_or(EvtchnError::InvalidPort(port))?;
            if entry.handler.is_some() {
                return Err(EvtchnError::HandlerAlreadyBound(port));
            }
            entry.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut entry.pending)
        };
        if fire {
            handler();
        }
        Ok(())
    }

    fn signal(&self, domain: DomainId, port: LocalPort) -> Result<()> {
        let handler = {
            let mut inner = self.inner.lock();
            let entry = inner.ports.get(&(domain, port.0)).ok_or(EvtchnError::InvalidPort(port))?;
            let PortState::Interdomain { remote, port: remote_port } = entry.state else {
                trace!("{domain} signalled unbound port {port}; dropped");
                return Ok(());
            };
            match inner.ports.get_mut(&(remote, remote_port)) {
                Some(peer) => match &peer.handler {
                    Some(handler) => Some(Arc::clone(handler)),
                    None => {
                        peer.pending = true;
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(handler) = handler {
            handler();
        }
        Ok(())
    }

    fn free(&self, domain: DomainId, port: LocalPort) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.ports.remove(&(domain, port.0)).ok_or(EvtchnError::InvalidPort(port))?;
        if let PortState::Interdomain { remote, port: remote_port } = entry.state {
            if let Some(peer) = inner.ports.get_mut(&(remote, remote_port)) {
                peer.state = PortState::Unbound { remote: domain };
            }
        }
        debug!("{domain} closed port {port}");
        Ok(())
    }
}

/// View of a [`HostEventChannels`] table bound to one domain.
#[derive(Clone)]
pub struct DomainEvents {
    table: Arc<HostEventChannels>,
    domain: DomainId,
}

impl EventChannel for DomainEvents {
    fn domain(&self) -> DomainId {
        self.domain
    }

    fn allocate(&self, remote: DomainId) -> Result<LocalPort> {
        self.table.allocate(self.domain, remote)
    }

    fn bind_remote(&self, remote: DomainId, remote_port: RemotePort) -> Result<Binding> {
        self.table.bind_remote(self.domain, remote, remote_port)
    }

    fn bind_handler(&self, port: LocalPort, handler: Handler) -> Result<()> {
        self.table.bind_handler(self.domain, port, handler)
    }

    fn signal(&self, port: LocalPort) -> Result<()> {
        self.table.signal(self.domain, port)
    }

    fn free(&self, port: LocalPort) -> Result<()> {
        self.table.free(self.domain, port)
    }
}
