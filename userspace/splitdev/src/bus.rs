// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host device model driving endpoints from directory watches
//!
//! OWNERS: @runtime
//!
//! [`HostPlatform`] owns the in-process directory, grant table and event
//! channels of one host. [`HostBus`] plays the toolstack and device model on
//! top of it: it creates device nodes, probes and removes endpoints and
//! delivers peer-state watch events through [`HostBus::pump`].
//!
//! Watch events are queued and delivered by `pump` on the caller's thread,
//! never from inside a directory write, so an endpoint never re-enters itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use nexus_directory::{join, Directory, HostStore, Transaction, Watch};
use nexus_evtchn::HostEventChannels;
use nexus_grant::{DomainId, HostGrantTable};
use parking_lot::Mutex;

use crate::config::Limits;
use crate::device::{Capabilities, DeviceClass, DeviceIdentity, Side};
use crate::endpoint::{Disposition, Endpoint, ONLINE_KEY, STATE_KEY};
use crate::error::{Error, Result};
use crate::state::PeerState;

/// In-process stand-ins for the hypervisor services of one host.
#[derive(Clone)]
pub struct HostPlatform {
    store: Arc<HostStore>,
    grants: Arc<HostGrantTable>,
    events: Arc<HostEventChannels>,
}

impl HostPlatform {
    /// Creates empty services with per-domain `limits`.
    pub fn new(limits: &Limits) -> Self {
        Self {
            store: HostStore::new(),
            grants: HostGrantTable::new(limits.grant_entries),
            events: HostEventChannels::new(limits.event_ports),
        }
    }

    /// Directory store.
    pub fn store(&self) -> &Arc<HostStore> {
        &self.store
    }

    /// Grant table.
    pub fn grants(&self) -> &Arc<HostGrantTable> {
        &self.grants
    }

    /// Event channels.
    pub fn events(&self) -> &Arc<HostEventChannels> {
        &self.events
    }

    /// Capabilities scoped to `domain`.
    pub fn capabilities(&self, domain: DomainId) -> Capabilities {
        Capabilities {
            grants: Arc::new(self.grants.for_domain(domain)),
            events: Arc::new(self.events.for_domain(domain)),
            directory: Arc::new(self.store.for_domain(domain)),
        }
    }
}

struct Bound {
    endpoint: Arc<Endpoint>,
    watch: Watch,
}

/// Host device model for split devices.
pub struct HostBus {
    platform: HostPlatform,
    classes: Mutex<BTreeMap<String, DeviceClass>>,
    bound: Mutex<BTreeMap<String, Bound>>,
}

impl HostBus {
    /// Creates a bus over `platform`.
    pub fn new(platform: HostPlatform) -> Self {
        Self { platform, classes: Mutex::new(BTreeMap::new()), bound: Mutex::new(BTreeMap::new()) }
    }

    /// Underlying services.
    pub fn platform(&self) -> &HostPlatform {
        &self.platform
    }

    /// Writes both device nodes as the toolstack would and hands each domain
    /// ownership of its node. Returns the frontend and backend identities.
    pub fn create_device(
        &self,
        class: &DeviceClass,
        frontend: DomainId,
        backend: DomainId,
        devid: u32,
    ) -> Result<(DeviceIdentity, DeviceIdentity)> {
        let front_node = format!("local/domain/{}/device/{}/{devid}", frontend.value(), class.name);
        let back_node =
            format!("local/domain/{}/backend/{}/{}/{devid}", backend.value(), class.name, frontend.value());

        let mut txn = Transaction::new();
        txn.write(join(&front_node, "backend"), &back_node)
            .write(join(&front_node, "backend-id"), backend.value())
            .write(join(&back_node, "frontend"), &front_node)
            .write(join(&back_node, "frontend-id"), frontend.value())
            .write(join(&back_node, ONLINE_KEY), 1);
        self.platform.store.for_domain(DomainId::CONTROL).commit(txn)?;
        self.platform.store.set_owner(&front_node, frontend)?;
        self.platform.store.set_owner(&back_node, backend)?;
        self.classes.lock().insert(class.name.clone(), class.clone());
        info!("created {} device {devid}: {front_node} <-> {back_node}", class.name);

        let front = DeviceIdentity {
            class: class.name.clone(),
            side: Side::Frontend,
            domid: frontend,
            devid,
            nodename: front_node.clone(),
            otherend: back_node.clone(),
            otherend_id: backend,
        };
        let back = DeviceIdentity {
            class: class.name.clone(),
            side: Side::Backend,
            domid: backend,
            devid,
            nodename: back_node,
            otherend: front_node,
            otherend_id: frontend,
        };
        Ok((front, back))
    }

    /// Sets the backend node's `online` flag as the toolstack would.
    pub fn set_online(&self, backend: &DeviceIdentity, online: bool) -> Result<()> {
        let control = self.platform.store.for_domain(DomainId::CONTROL);
        control.write(&join(&backend.nodename, ONLINE_KEY), if online { "1" } else { "0" })?;
        Ok(())
    }

    /// Builds the endpoint for `identity`, watches the peer's state and activates it.
    pub fn probe(&self, identity: &DeviceIdentity) -> Result<Arc<Endpoint>> {
        if self.bound.lock().contains_key(&identity.nodename) {
            return Err(Error::AlreadyProbed(identity.nodename.clone()));
        }
        let class = self
            .classes
            .lock()
            .get(&identity.class)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(identity.nodename.clone()))?;
        let caps = self.platform.capabilities(identity.domid);
        let watch = caps.directory.watch(&join(&identity.otherend, STATE_KEY))?;
        let endpoint = Endpoint::new(identity.clone(), class, caps);
        endpoint.on_activate()?;
        debug!("probed {identity}");
        self.bound
            .lock()
            .insert(identity.nodename.clone(), Bound { endpoint: Arc::clone(&endpoint), watch });
        Ok(endpoint)
    }

    /// Deactivates and drops the endpoint for `identity`.
    pub fn remove(&self, identity: &DeviceIdentity) -> Result<()> {
        let bound = self
            .bound
            .lock()
            .remove(&identity.nodename)
            .ok_or_else(|| Error::UnknownDevice(identity.nodename.clone()))?;
        bound.endpoint.on_deactivate();
        drop(bound.watch);
        info!("removed {identity}");
        Ok(())
    }

    /// Delivers one peer-state observation to the endpoint for `identity`.
    pub fn otherend_state_changed(&self, identity: &DeviceIdentity, state: PeerState) -> Result<Disposition> {
        let endpoint = self.endpoint(identity).ok_or_else(|| Error::UnknownDevice(identity.nodename.clone()))?;
        let disposition = endpoint.on_peer_state_changed(state);
        if disposition == Disposition::Unregister {
            self.remove(identity)?;
        }
        Ok(disposition)
    }

    /// Live endpoint for `identity`.
    pub fn endpoint(&self, identity: &DeviceIdentity) -> Option<Arc<Endpoint>> {
        self.bound.lock().get(&identity.nodename).map(|bound| Arc::clone(&bound.endpoint))
    }

    /// Delivers queued watch events until none are left. Returns how many were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch: Vec<(DeviceIdentity, Vec<PeerState>)> = self
                .bound
                .lock()
                .values()
                .map(|bound| {
                    let states: Vec<PeerState> =
                        bound.watch.drain().into_iter().map(|event| PeerState::parse(event.value.as_deref())).collect();
                    (bound.endpoint.identity().clone(), states)
                })
                .filter(|(_, states)| !states.is_empty())
                .collect();
            if batch.is_empty() {
                return delivered;
            }
            for (identity, states) in batch {
                for state in states {
                    match self.otherend_state_changed(&identity, state) {
                        Ok(_) => delivered += 1,
                        Err(Error::UnknownDevice(_)) => debug!("{identity}: event after removal dropped"),
                        Err(err) => warn!("{identity}: {err}"),
                    }
                }
            }
        }
    }
}
