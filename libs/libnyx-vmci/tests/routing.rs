//! Datagram routing between loopback contexts

use std::sync::{Arc, Mutex, Weak};

use libnyx_vmci::context::ContextRegistry;
use libnyx_vmci::handle::{HOST_CONTEXT_ID, HYPERVISOR_CONTEXT_ID, INVALID_ID};
use libnyx_vmci::route::route;
use libnyx_vmci::{
    Datagram, Event, EventKind, Fabric, Handle, Personality, Route, Transport, VmciConfig,
    VmciError,
};
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Inbox = Arc<Mutex<Vec<Datagram>>>;

fn listen(transport: &Transport, resource: u32) -> (Handle, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    let handle = transport
        .datagram_create(
            resource,
            Arc::new(move |dg: &Datagram| sink.lock().unwrap().push(dg.clone())),
        )
        .unwrap();
    (handle, inbox)
}

#[test]
fn test_echo_between_guest_and_host() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(VmciConfig::default(), 10).unwrap();

    let weak: Weak<Transport> = Arc::downgrade(&host);
    let echo = host
        .datagram_create(
            3000,
            Arc::new(move |dg: &Datagram| {
                if let Some(host) = weak.upgrade() {
                    let reply = Datagram::new(dg.src, dg.dst, dg.payload.to_ascii_uppercase());
                    host.datagram_send(reply).unwrap();
                }
            }),
        )
        .unwrap();

    let (client, inbox) = listen(&guest, INVALID_ID);
    assert_eq!(client.context, 10);

    guest
        .datagram_send(Datagram::new(echo, client, b"hello".to_vec()))
        .unwrap();

    let inbox = inbox.lock().unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].src, echo);
    assert_eq!(inbox[0].payload, b"HELLO");
}

#[test]
fn test_guest_source_is_filled_in() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(VmciConfig::default(), 10).unwrap();
    let (service, inbox) = listen(&host, 3000);

    guest
        .datagram_send(Datagram::new(service, Handle::new(INVALID_ID, 77), Vec::new()))
        .unwrap();
    assert_eq!(inbox.lock().unwrap()[0].src, Handle::new(10, 77));
}

#[test]
fn test_spoofed_source_is_refused() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let _guest = fabric.guest(VmciConfig::default(), 10).unwrap();
    let (service, inbox) = listen(&host, 3000);

    let forged = Datagram::new(service, Handle::new(11, 5), b"x".to_vec());
    assert!(matches!(
        host.datagram_dispatch(10, forged),
        Err(VmciError::NoAccess)
    ));
    assert!(inbox.lock().unwrap().is_empty());
}

#[test]
fn test_vm_to_vm_is_unreachable() {
    init_tracing();
    let fabric = Fabric::new();
    let _host = fabric.host(VmciConfig::default()).unwrap();
    let a = fabric.guest(VmciConfig::default(), 10).unwrap();
    let b = fabric.guest(VmciConfig::default(), 11).unwrap();
    let (target, inbox) = listen(&b, 4000);

    assert!(matches!(
        a.datagram_send(Datagram::new(target, Handle::new(INVALID_ID, 1), Vec::new())),
        Err(VmciError::Unreachable)
    ));
    assert!(inbox.lock().unwrap().is_empty());
}

#[test]
fn test_missing_handlers() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(VmciConfig::default(), 10).unwrap();

    assert!(matches!(
        guest.datagram_send(Datagram::new(
            Handle::new(HOST_CONTEXT_ID, 3000),
            Handle::new(INVALID_ID, 1),
            Vec::new()
        )),
        Err(VmciError::Unreachable)
    ));
    assert!(matches!(
        host.datagram_send(Datagram::new(Handle::new(10, 3000), Handle::new(INVALID_ID, 1), Vec::new())),
        Err(VmciError::NotFound)
    ));
    assert!(matches!(
        guest.datagram_send(Datagram::new(
            Handle::new(HYPERVISOR_CONTEXT_ID, 1),
            Handle::new(INVALID_ID, 1),
            Vec::new()
        )),
        Err(VmciError::Unreachable)
    ));
}

#[test]
fn test_removed_context_becomes_unreachable() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(VmciConfig::default(), 10).unwrap();
    let (target, _inbox) = listen(&guest, 4000);

    let removed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&removed);
    host.events().subscribe(
        EventKind::ContextRemoved,
        Arc::new(move |event: &Event| seen.lock().unwrap().push(event.context)),
    );

    host.datagram_send(Datagram::new(target, Handle::new(INVALID_ID, 1), Vec::new()))
        .unwrap();
    fabric.remove(10);
    assert_eq!(removed.lock().unwrap().as_slice(), &[10]);
    assert!(matches!(
        host.datagram_send(Datagram::new(target, Handle::new(INVALID_ID, 1), Vec::new())),
        Err(VmciError::Unreachable)
    ));
}

#[test]
fn test_payload_limit() {
    init_tracing();
    let fabric = Fabric::new();
    let mut config = VmciConfig::default();
    config.datagram.max_payload = 16;
    let host = fabric.host(config).unwrap();
    let (service, inbox) = listen(&host, 3000);

    host.datagram_send(Datagram::new(service, Handle::new(INVALID_ID, 1), vec![0; 16]))
        .unwrap();
    let err = host
        .datagram_send(Datagram::new(service, Handle::new(INVALID_ID, 1), vec![0; 17]))
        .unwrap_err();
    assert!(matches!(err, VmciError::PayloadTooLarge { len: 17, max: 16 }));
    assert_eq!(inbox.lock().unwrap().len(), 1);
}

fn personality() -> impl Strategy<Value = Personality> {
    prop_oneof![
        Just(Personality::GUEST),
        Just(Personality::HOST),
        Just(Personality::GUEST | Personality::HOST),
    ]
}

fn context() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(HYPERVISOR_CONTEXT_ID),
        Just(HOST_CONTEXT_ID),
        Just(INVALID_ID),
        3u32..16,
    ]
}

proptest! {
    #[test]
    fn test_route_always_settles_the_source(
        personality in personality(),
        known in prop::collection::vec(3u32..16, 0..4),
        src_context in context(),
        dst_context in context(),
        from_guest in any::<bool>(),
    ) {
        let registry = ContextRegistry::new(10, personality);
        for cid in known {
            registry.add_context(cid);
        }
        let mut src = Handle::new(src_context, 1);
        let dst = Handle::new(dst_context, 1);

        let result = route(&registry, &mut src, &dst, from_guest);
        if from_guest && dst.context == HYPERVISOR_CONTEXT_ID {
            prop_assert!(matches!(result, Err(VmciError::Unreachable)));
        }
        if let Ok(decision) = result {
            prop_assert_ne!(decision, Route::None);
            prop_assert_ne!(dst.context, INVALID_ID);
            // Only traffic to the hypervisor may keep an unknown source
            if dst.context != HYPERVISOR_CONTEXT_ID {
                prop_assert_ne!(src.context, INVALID_ID);
            }
            if from_guest && dst.context == HOST_CONTEXT_ID {
                prop_assert_eq!(decision, Route::AsHost);
            }
        }
    }
}
