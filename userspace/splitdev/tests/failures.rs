// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Failure handling of the split-device handshake
//! TEST_SCOPE: Endpoint, HostBus, transport rollback
//! TEST_SCENARIOS:
//!   - Resource failures during connect leave the local state unchanged and report a device error
//!   - A refused publication of the ring keys releases the freshly granted ring
//!   - Unexpected peer states are reported without advancing
//!   - A protocol fault freezes the endpoint
//!   - Offline or vanished peers lead to unregistration
//!   - Removal while connected drives the teardown edges without leaking or early revocation

use nexus_directory::{join, Directory};
use nexus_grant::{DomainId, GrantOp};
use splitdev::{
    ConnState, DeviceClass, DeviceIdentity, Disposition, Endpoint, Error, Fault, HostBus, HostPlatform, Limits,
    Message, PeerState, RING_REF_KEY,
};

const FRONT: DomainId = DomainId(1);
const BACK: DomainId = DomainId(0);

fn setup() -> (HostBus, DeviceIdentity, DeviceIdentity) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = HostBus::new(HostPlatform::new(&Limits::default()));
    let class = DeviceClass::new("mydevice").with_greeting(Message::from_text("Hello world\n").unwrap());
    let (front, back) = bus.create_device(&class, FRONT, BACK, 0).unwrap();
    (bus, front, back)
}

fn error_of(bus: &HostBus, identity: &DeviceIdentity) -> Option<String> {
    bus.platform().store().for_domain(DomainId::CONTROL).read(&join(&identity.nodename, "error")).unwrap()
}

fn assert_no_leaks(bus: &HostBus) {
    let platform = bus.platform();
    assert_eq!(platform.grants().live_grants(), 0);
    assert_eq!(platform.grants().live_mappings(), 0);
    assert_eq!(platform.events().live_ports(FRONT), 0);
    assert_eq!(platform.events().live_ports(BACK), 0);
}

#[test]
fn grant_failure_keeps_frontend_initialising() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.platform().grants().fail_next_grant();
    bus.pump();

    assert_eq!(front_ep.state(), ConnState::Initialising);
    assert_eq!(back_ep.state(), ConnState::InitWait);
    assert!(error_of(&bus, &front).unwrap().starts_with("ENOSPC"));
    assert_eq!(bus.pump(), 0, "no automatic retry");
    assert_eq!(front_ep.state(), ConnState::Initialising);
    assert_no_leaks(&bus);
}

#[test]
fn port_failure_rolls_back_grant() {
    let (bus, front, back) = setup();
    bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.platform().events().fail_next_allocate();
    bus.pump();

    assert_eq!(front_ep.state(), ConnState::Initialising);
    assert!(error_of(&bus, &front).unwrap().starts_with("ENOSPC"));
    let ops = bus.platform().grants().operations();
    assert!(matches!(ops.as_slice(), [GrantOp::Grant { .. }, GrantOp::Revoke { .. }]));
    assert_no_leaks(&bus);
}

#[test]
fn refused_ring_publication_rolls_back_transport() {
    let (bus, front, back) = setup();
    bus.platform().store().set_owner(&join(&front.nodename, RING_REF_KEY), BACK).unwrap();
    let back_ep = bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.pump();

    assert_eq!(front_ep.state(), ConnState::Initialising);
    assert_eq!(back_ep.state(), ConnState::InitWait);
    assert!(!front_ep.has_transport());
    assert!(error_of(&bus, &front).unwrap().starts_with("EACCES"));
    let ops = bus.platform().grants().operations();
    assert!(matches!(ops.as_slice(), [GrantOp::Grant { .. }, GrantOp::Revoke { .. }]));
    assert_no_leaks(&bus);
}

#[test]
fn map_failure_keeps_backend_in_initwait() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.platform().grants().fail_next_map();
    bus.pump();

    assert_eq!(front_ep.state(), ConnState::Connected);
    assert_eq!(back_ep.state(), ConnState::InitWait);
    assert!(!back_ep.has_transport());
    assert!(error_of(&bus, &back).unwrap().starts_with("ENOENT"));
    assert_eq!(bus.platform().events().live_ports(BACK), 0);
}

#[test]
fn unexpected_frontend_states_are_reported() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    let guest = bus.platform().store().for_domain(FRONT);
    let state = join(&front.nodename, "state");

    guest.write(&state, "1").unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::InitWait);

    guest.write(&state, "2").unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::InitWait);
    assert!(error_of(&bus, &back).unwrap().starts_with("EINVAL"));

    guest.write(&state, "banana").unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::InitWait);
    assert_eq!(back_ep.peer_state(), Some(PeerState::Unrecognized("banana".into())));
    assert_eq!(back_ep.fault(), None);

    guest.write(&state, "3").unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::InitWait, "Initialised is a no-op");
}

#[test]
fn protocol_fault_freezes_endpoint() {
    let (bus, _front, back) = setup();
    let platform = bus.platform();
    let class = DeviceClass::new("mydevice");
    let endpoint = Endpoint::new(back.clone(), class, platform.capabilities(BACK));

    let disposition = endpoint.on_peer_state_changed(PeerState::Known(ConnState::Initialising));
    assert_eq!(disposition, Disposition::Keep);
    assert_eq!(endpoint.fault(), Some(Fault::UnknownLocalState));
    assert!(error_of(&bus, &back).unwrap().starts_with("EPROTO"));

    endpoint.on_peer_state_changed(PeerState::Known(ConnState::Connected));
    assert_eq!(endpoint.state(), ConnState::Unknown);
    assert_eq!(endpoint.send(&Message::default()), Err(Error::Frozen));
    assert_eq!(endpoint.close(), Err(Error::Frozen));

    endpoint.on_deactivate();
    assert_eq!(endpoint.state(), ConnState::Closed);
}

#[test]
fn offline_backend_unregisters_once_closed() {
    let (bus, front, back) = setup();
    bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.pump();

    bus.set_online(&back, false).unwrap();
    front_ep.close().unwrap();
    bus.pump();
    assert!(bus.endpoint(&back).is_none());
    assert_eq!(front_ep.state(), ConnState::Closed);
    assert_no_leaks(&bus);
    assert_eq!(bus.platform().store().watch_count(), 1);
}

#[test]
fn vanished_frontend_closes_and_unregisters_backend() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::Connected);

    let control = bus.platform().store().for_domain(DomainId::CONTROL);
    control.remove(&join(&front.nodename, "state")).unwrap();
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::Closed);
    assert!(bus.endpoint(&back).is_none());
    assert_eq!(front_ep.state(), ConnState::Closed);
    assert_no_leaks(&bus);
}

#[test]
fn backend_removal_while_connected_passes_through_closing() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    let front_ep = bus.probe(&front).unwrap();
    bus.pump();

    bus.remove(&back).unwrap();
    assert_eq!(back_ep.state(), ConnState::Closed);
    bus.pump();
    assert_eq!(front_ep.state(), ConnState::Closed);

    let ops = bus.platform().grants().operations();
    let unmap = ops.iter().position(|op| matches!(op, GrantOp::Unmap { .. })).unwrap();
    let revoke = ops.iter().position(|op| matches!(op, GrantOp::Revoke { .. })).unwrap();
    assert!(unmap < revoke);
    assert_no_leaks(&bus);
}

#[test]
fn frontend_removal_while_connected_never_revokes_early() {
    let (bus, front, back) = setup();
    let back_ep = bus.probe(&back).unwrap();
    bus.probe(&front).unwrap();
    bus.pump();

    bus.remove(&front).unwrap();
    assert!(error_of(&bus, &front).unwrap().starts_with("EBUSY"));
    assert_eq!(bus.platform().grants().live_grants(), 1);
    bus.pump();
    assert_eq!(back_ep.state(), ConnState::Closed);

    let ops = bus.platform().grants().operations();
    assert!(ops.iter().any(|op| matches!(op, GrantOp::RevokeRefused { .. })));
    assert!(matches!(ops.last(), Some(GrantOp::DeferredRelease { .. })));
    assert!(!ops.iter().any(|op| matches!(op, GrantOp::Revoke { .. })));
    bus.remove(&back).unwrap();
    assert_no_leaks(&bus);
}
