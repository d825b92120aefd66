// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ring and notification setup/teardown for one endpoint
//!
//! The allocating side owns the page: it formats the ring, grants the page to
//! the peer and reserves an event channel port for it. The mapping side reads
//! those two numbers from the peer's node, maps the grant and binds to the
//! port. Teardown is best effort and split in two: disconnecting frees the
//! port and any mapping, while a grant is revoked separately once the peer
//! has unmapped it.

use std::sync::Arc;

use log::{debug, warn};
use nexus_directory::{join, read_parsed, Transaction};
use nexus_evtchn::{Latch, LocalPort, RemotePort};
use nexus_grant::{GrantError, GrantRef, MappedPage, Page};
use nexus_ring::{RingConsumer, RingProducer};

use crate::device::{Capabilities, DeviceClass, DeviceIdentity};
use crate::error::{Error, Result};
use crate::record::Message;

/// Directory key carrying the ring grant reference.
pub const RING_REF_KEY: &str = "rx-ring-ref";
/// Directory key carrying the allocator's event channel port.
pub const EVENT_CHANNEL_KEY: &str = "event-channel";

enum RingEnd {
    Producer(RingProducer<Message>),
    Consumer(RingConsumer<Message>),
}

impl RingEnd {
    fn attach(produces: bool, page: Page) -> Result<Self> {
        Ok(if produces {
            RingEnd::Producer(nexus_ring::init_as_producer(page)?)
        } else {
            RingEnd::Consumer(nexus_ring::init_as_consumer(page)?)
        })
    }
}

enum Share {
    Granted { gref: GrantRef },
    Mapped(MappedPage),
}

/// Live transport of one endpoint.
pub(crate) struct Transport {
    share: Share,
    port: LocalPort,
    ring: RingEnd,
}

fn release_grant(caps: &Capabilities, gref: GrantRef) {
    if let Err(err) = caps.grants.revoke(gref) {
        warn!("rollback: revoke of grant {gref} failed: {err}");
    }
}

fn release_port(caps: &Capabilities, port: LocalPort) {
    if let Err(err) = caps.events.free(port) {
        warn!("rollback: free of port {port} failed: {err}");
    }
}

fn release_mapping(caps: &Capabilities, mapped: MappedPage) {
    if let Err(err) = caps.grants.unmap(mapped) {
        warn!("rollback: unmap failed: {err}");
    }
}

fn read_key<T: core::str::FromStr>(caps: &Capabilities, node: &str, key: &str) -> Result<T> {
    read_parsed(caps.directory.as_ref(), &join(node, key)).map_err(Error::from_read)
}

impl Transport {
    /// Allocates, formats and grants the ring page and reserves a port for
    /// the peer. Nothing stays allocated when this fails.
    pub(crate) fn allocate(
        identity: &DeviceIdentity,
        class: &DeviceClass,
        caps: &Capabilities,
        latch: &Arc<Latch>,
    ) -> Result<Self> {
        let peer = identity.otherend_id;
        let page = caps.grants.alloc_page()?;
        nexus_ring::format::<Message>(&page)?;
        let gref = caps.grants.grant_page(peer, &page)?;
        let port = match caps.events.allocate(peer) {
            Ok(port) => port,
            Err(err) => {
                release_grant(caps, gref);
                return Err(err.into());
            }
        };
        let ring = caps
            .events
            .bind_handler(port, latch.handler())
            .map_err(Error::from)
            .and_then(|()| RingEnd::attach(class.producer == identity.side, page));
        match ring {
            Ok(ring) => {
                debug!("{identity}: granted ring {gref} to {peer}, port {port}");
                Ok(Self { share: Share::Granted { gref }, port, ring })
            }
            Err(err) => {
                release_port(caps, port);
                release_grant(caps, gref);
                Err(err)
            }
        }
    }

    /// Maps the ring the peer published and binds to its port.
    pub(crate) fn map(
        identity: &DeviceIdentity,
        class: &DeviceClass,
        caps: &Capabilities,
        latch: &Arc<Latch>,
    ) -> Result<Self> {
        let peer = identity.otherend_id;
        let raw: u32 = read_key(caps, &identity.otherend, RING_REF_KEY)?;
        let gref = GrantRef::from_raw(raw).ok_or_else(|| Error::InvalidValue {
            path: join(&identity.otherend, RING_REF_KEY),
            value: raw.to_string(),
        })?;
        let remote: u32 = read_key(caps, &identity.otherend, EVENT_CHANNEL_KEY)?;

        let mapped = caps.grants.map_grant(peer, gref)?;
        let ring = match RingEnd::attach(class.producer == identity.side, mapped.page().clone()) {
            Ok(ring) => ring,
            Err(err) => {
                release_mapping(caps, mapped);
                return Err(err);
            }
        };
        let binding = match caps.events.bind_remote(peer, RemotePort(remote)) {
            Ok(binding) => binding,
            Err(err) => {
                release_mapping(caps, mapped);
                return Err(err.into());
            }
        };
        let bound = caps
            .events
            .bind_handler(binding.local, latch.handler())
            .and_then(|()| caps.events.signal(binding.local));
        if let Err(err) = bound {
            release_port(caps, binding.local);
            release_mapping(caps, mapped);
            return Err(err.into());
        }
        debug!("{identity}: mapped ring {gref} of {peer}, port {} bound to {remote}", binding.local);
        Ok(Self { share: Share::Mapped(mapped), port: binding.local, ring })
    }

    /// Queues the keys the peer needs to map this transport.
    pub(crate) fn publish(&self, identity: &DeviceIdentity, txn: &mut Transaction) {
        if let Share::Granted { gref } = &self.share {
            txn.write(join(&identity.nodename, RING_REF_KEY), gref.value())
                .write(join(&identity.nodename, EVENT_CHANNEL_KEY), self.port.0);
        }
    }

    pub(crate) fn is_consumer(&self) -> bool {
        matches!(self.ring, RingEnd::Consumer(_))
    }

    /// Produces one record and notifies the peer.
    pub(crate) fn send(&mut self, caps: &Capabilities, msg: &Message) -> Result<()> {
        let RingEnd::Producer(producer) = &mut self.ring else {
            return Err(Error::NotProducer);
        };
        producer.produce(msg)?;
        caps.events.signal(self.port)?;
        Ok(())
    }

    /// Consumes every record currently on the ring.
    pub(crate) fn drain(&mut self, identity: &DeviceIdentity) -> Vec<Message> {
        let RingEnd::Consumer(consumer) = &mut self.ring else {
            return Vec::new();
        };
        let messages: Vec<Message> = std::iter::from_fn(|| consumer.consume()).collect();
        if consumer.is_corrupt() {
            warn!("{identity}: peer cursor is out of range, ring ignored");
        }
        messages
    }

    /// Frees the port and drops the ring end. A mapping is released here;
    /// a grant is handed back so it can be revoked once the peer has unmapped.
    pub(crate) fn disconnect(self, identity: &DeviceIdentity, caps: &Capabilities) -> Option<GrantRef> {
        let Transport { share, port, ring } = self;
        if let Err(err) = caps.events.free(port) {
            warn!("{identity}: free of port {port} failed: {err}");
        }
        drop(ring);
        match share {
            Share::Mapped(mapped) => {
                let gref = mapped.grant_ref();
                match caps.grants.unmap(mapped) {
                    Ok(()) => debug!("{identity}: unmapped ring {gref}"),
                    Err(err) => warn!("{identity}: unmap of ring {gref} failed: {err}"),
                }
                None
            }
            Share::Granted { gref } => Some(gref),
        }
    }

    /// Releases everything at once. Returns the failure worth reporting to
    /// the directory, if any.
    pub(crate) fn teardown(self, identity: &DeviceIdentity, caps: &Capabilities) -> Option<Error> {
        let gref = self.disconnect(identity, caps)?;
        revoke(identity, caps, gref)
    }
}

/// Revokes a ring grant. A grant the peer still maps is deferred to its last
/// unmap and the refusal is returned for reporting; other failures are only
/// logged.
pub(crate) fn revoke(identity: &DeviceIdentity, caps: &Capabilities, gref: GrantRef) -> Option<Error> {
    match caps.grants.revoke(gref) {
        Ok(()) => {
            debug!("{identity}: revoked ring {gref}");
            None
        }
        Err(err @ GrantError::StillMapped { .. }) => {
            warn!("{identity}: ring {gref} still mapped by peer, deferring revoke");
            if let Err(defer) = caps.grants.defer_revoke(gref) {
                warn!("{identity}: deferring revoke of {gref} failed: {defer}");
            }
            Some(err.into())
        }
        Err(err) => {
            warn!("{identity}: revoke of ring {gref} failed: {err}");
            None
        }
    }
}
