//! Queue pair behaviour across a loopback guest and host
//!
//! The guest creates every pair with the host as its peer; the host attaches
//! with the sizes swapped. Data enqueued on one side is dequeued on the other.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libnyx_vmci::handle::HOST_CONTEXT_ID;
use libnyx_vmci::{
    Event, EventKind, Fabric, Handle, QueuePair, QueuePairFlags, Transport, VmciConfig, VmciError,
};
use proptest::prelude::*;

const GUEST_CID: u32 = 10;

struct Setup {
    fabric: Arc<Fabric>,
    _host: Arc<Transport>,
    guest: Arc<Transport>,
    guest_pair: Arc<QueuePair>,
    host_pair: Arc<QueuePair>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup_with(config: VmciConfig, produce_size: u64, consume_size: u64) -> Setup {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(config, GUEST_CID).unwrap();

    let guest_pair = QueuePair::alloc(
        &guest,
        Handle::INVALID,
        produce_size,
        consume_size,
        HOST_CONTEXT_ID,
        QueuePairFlags::empty(),
    )
    .unwrap();
    let host_pair = QueuePair::alloc(
        &host,
        guest_pair.handle(),
        consume_size,
        produce_size,
        GUEST_CID,
        QueuePairFlags::ATTACH_ONLY,
    )
    .unwrap();

    Setup {
        fabric,
        _host: host,
        guest,
        guest_pair,
        host_pair,
    }
}

fn setup(produce_size: u64, consume_size: u64) -> Setup {
    setup_with(VmciConfig::default(), produce_size, consume_size)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_sides_are_classified() {
    let s = setup(64, 128);
    assert!(s.guest_pair.is_guest_side());
    assert!(!s.host_pair.is_guest_side());
    assert_eq!(s.host_pair.handle(), s.guest_pair.handle());
    assert_eq!(s.host_pair.produce_size(), 128);
    assert_eq!(s.host_pair.consume_size(), 64);
}

#[test]
fn test_bytes_cross_in_both_directions() {
    let s = setup(64, 64);

    assert_eq!(s.guest_pair.enqueue(b"to the host").unwrap(), 11);
    assert_eq!(s.host_pair.enqueue(b"to the guest").unwrap(), 12);

    let mut buf = [0u8; 32];
    let n = s.host_pair.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"to the host");
    let n = s.guest_pair.dequeue(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"to the guest");
}

#[test]
fn test_full_and_empty_leave_offsets_alone() {
    let s = setup(64, 64);

    let filler = [0x5a_u8; 63];
    assert_eq!(s.guest_pair.enqueue(&filler).unwrap(), 63);
    assert_eq!(s.guest_pair.produce_free_space().unwrap(), 0);

    let before = s.guest_pair.produce_indexes().unwrap();
    assert!(matches!(s.guest_pair.enqueue(b"x"), Err(VmciError::NoSpace)));
    assert_eq!(s.guest_pair.produce_indexes().unwrap(), before);

    let mut sink = [0u8; 63];
    assert_eq!(s.host_pair.dequeue(&mut sink).unwrap(), 63);
    let before = s.host_pair.consume_indexes().unwrap();
    assert!(matches!(s.host_pair.dequeue(&mut sink), Err(VmciError::NoData)));
    assert!(matches!(s.host_pair.peek(&mut sink), Err(VmciError::NoData)));
    assert_eq!(s.host_pair.consume_indexes().unwrap(), before);
}

#[test]
fn test_partial_enqueue_when_nearly_full() {
    let s = setup(16, 16);
    assert_eq!(s.guest_pair.enqueue(&[1u8; 10]).unwrap(), 10);
    assert_eq!(s.guest_pair.enqueue(&[2u8; 10]).unwrap(), 5);
    assert_eq!(s.host_pair.consume_buf_ready().unwrap(), 15);
}

#[test]
fn test_wraparound() {
    let s = setup(16, 16);
    let mut buf = [0u8; 16];

    assert_eq!(s.guest_pair.enqueue(b"0123456789").unwrap(), 10);
    assert_eq!(s.host_pair.dequeue(&mut buf[..10]).unwrap(), 10);

    let payload = b"abcdefghijkl";
    assert_eq!(s.guest_pair.enqueue(payload).unwrap(), 12);
    assert_eq!(s.guest_pair.produce_indexes().unwrap(), (6, 10));

    assert_eq!(s.host_pair.peek(&mut buf[..12]).unwrap(), 12);
    assert_eq!(&buf[..12], payload);
    assert_eq!(s.host_pair.dequeue(&mut buf[..12]).unwrap(), 12);
    assert_eq!(&buf[..12], payload);
    assert_eq!(s.host_pair.consume_indexes().unwrap(), (6, 6));
}

#[test]
fn test_vectored_io() {
    let s = setup(32, 32);
    let parts = [IoSlice::new(b"head"), IoSlice::new(b""), IoSlice::new(b"-tail")];
    assert_eq!(s.guest_pair.enqueue_vectored(&parts).unwrap(), 9);

    let mut first = [0u8; 3];
    let mut second = [0u8; 8];
    {
        let mut bufs = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];
        assert_eq!(s.host_pair.peek_vectored(&mut bufs).unwrap(), 9);
    }
    assert_eq!(&first, b"hea");
    assert_eq!(&second[..6], b"d-tail");
    assert_eq!(s.host_pair.consume_buf_ready().unwrap(), 9);

    let mut whole = [0u8; 9];
    let mut bufs = [IoSliceMut::new(&mut whole)];
    assert_eq!(s.host_pair.dequeue_vectored(&mut bufs).unwrap(), 9);
    assert_eq!(&whole, b"head-tail");
    assert_eq!(s.host_pair.consume_buf_ready().unwrap(), 0);
}

#[test]
fn test_blocking_pair_waits_for_remap() {
    let s = setup(64, 64);
    let handle = s.guest_pair.handle();
    s.fabric.unmap_queue_pair(handle, GUEST_CID).unwrap();

    let pair = Arc::clone(&s.guest_pair);
    let writer = thread::spawn(move || pair.enqueue(b"after resume"));

    wait_for("writer to block", || s.guest_pair.blocked_waiters() == 1);
    s.fabric.remap_queue_pair(handle, GUEST_CID).unwrap();

    assert_eq!(writer.join().unwrap().unwrap(), 12);
    assert_eq!(s.host_pair.consume_buf_ready().unwrap(), 12);
}

#[test]
fn test_detach_fails_blocked_operations() {
    let s = setup(64, 64);
    s.fabric.unmap_queue_pair(s.guest_pair.handle(), GUEST_CID).unwrap();

    let pair = Arc::clone(&s.guest_pair);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 8];
        pair.dequeue(&mut buf)
    });

    wait_for("reader to block", || s.guest_pair.blocked_waiters() == 1);
    s.guest_pair.detach().unwrap();

    assert!(matches!(reader.join().unwrap(), Err(VmciError::Detached)));
    assert!(matches!(s.guest_pair.enqueue(b"x"), Err(VmciError::Detached)));
    s.guest_pair.detach().unwrap();
}

#[test]
fn test_nonblocking_pair_reports_not_ready() {
    let mut config = VmciConfig::default();
    config.queue_pair.blocking = false;
    let s = setup_with(config, 64, 64);
    assert!(s.guest_pair.flags().contains(QueuePairFlags::NONBLOCK));

    s.fabric.unmap_queue_pair(s.guest_pair.handle(), GUEST_CID).unwrap();
    assert!(matches!(s.guest_pair.enqueue(b"x"), Err(VmciError::NotReady)));
    assert!(matches!(s.guest_pair.produce_free_space(), Err(VmciError::NotReady)));

    // The host's own mapping is untouched
    assert_eq!(s.host_pair.enqueue(b"x").unwrap(), 1);

    s.fabric.remap_queue_pair(s.guest_pair.handle(), GUEST_CID).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(s.guest_pair.dequeue(&mut buf).unwrap(), 1);
}

#[test]
fn test_peer_events() {
    init_tracing();
    let fabric = Fabric::new();
    let host = fabric.host(VmciConfig::default()).unwrap();
    let guest = fabric.guest(VmciConfig::default(), GUEST_CID).unwrap();

    let attached = Arc::new(AtomicUsize::new(0));
    let detached = Arc::new(AtomicUsize::new(0));
    for (kind, counter) in [
        (EventKind::QueuePairPeerAttach, Arc::clone(&attached)),
        (EventKind::QueuePairPeerDetach, Arc::clone(&detached)),
    ] {
        guest.events().subscribe(
            kind,
            Arc::new(move |event: &Event| {
                assert_eq!(event.context, HOST_CONTEXT_ID);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let guest_pair = QueuePair::alloc(
        &guest,
        Handle::INVALID,
        64,
        64,
        HOST_CONTEXT_ID,
        QueuePairFlags::empty(),
    )
    .unwrap();
    assert_eq!(attached.load(Ordering::SeqCst), 0);

    let host_pair = QueuePair::alloc(
        &host,
        guest_pair.handle(),
        64,
        64,
        GUEST_CID,
        QueuePairFlags::ATTACH_ONLY,
    )
    .unwrap();
    assert_eq!(attached.load(Ordering::SeqCst), 1);

    host_pair.detach().unwrap();
    assert_eq!(detached.load(Ordering::SeqCst), 1);
    assert_eq!(fabric.queue_pair_count(), 1);

    guest_pair.detach().unwrap();
    assert_eq!(fabric.queue_pair_count(), 0);
}

#[test]
fn test_attach_rules() {
    let s = setup(64, 128);
    let other = s.fabric.guest(VmciConfig::default(), 11).unwrap();

    let err = QueuePair::alloc(
        &other,
        s.guest_pair.handle(),
        128,
        64,
        GUEST_CID,
        QueuePairFlags::ATTACH_ONLY,
    )
    .unwrap_err();
    assert!(matches!(err, VmciError::AlreadyExists | VmciError::NoAccess));

    let err = QueuePair::alloc(
        &s.guest,
        Handle::INVALID,
        64,
        64,
        HOST_CONTEXT_ID,
        QueuePairFlags::ATTACH_ONLY,
    )
    .unwrap_err();
    assert!(matches!(err, VmciError::InvalidArgs(_)));
}

#[test]
fn test_size_limits() {
    init_tracing();
    let fabric = Fabric::new();
    let mut config = VmciConfig::default();
    config.queue_pair.max_memory = 4096;
    let guest = fabric.guest(config, GUEST_CID).unwrap();

    let err = QueuePair::alloc(&guest, Handle::INVALID, 0, 64, HOST_CONTEXT_ID, QueuePairFlags::empty())
        .unwrap_err();
    assert!(matches!(err, VmciError::InvalidArgs(_)));

    let err = QueuePair::alloc(&guest, Handle::INVALID, 4096, 1, HOST_CONTEXT_ID, QueuePairFlags::empty())
        .unwrap_err();
    assert!(matches!(err, VmciError::NoMem(_)));

    let err = QueuePair::alloc(
        &guest,
        Handle::INVALID,
        u64::MAX,
        2,
        HOST_CONTEXT_ID,
        QueuePairFlags::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, VmciError::NoMem(_)));
}

#[derive(Clone, Debug)]
enum Op {
    Write(usize),
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0usize..40).prop_map(Op::Write), (0usize..40).prop_map(Op::Read)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_ring_matches_fifo_model(ops in prop::collection::vec(op(), 1..60)) {
        const SIZE: u64 = 64;
        let s = setup(SIZE, SIZE);
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        for op in ops {
            match op {
                Op::Write(len) => {
                    let data: Vec<u8> = (0..len)
                        .map(|_| {
                            next = next.wrapping_add(1);
                            next
                        })
                        .collect();
                    let free = SIZE as usize - 1 - model.len();
                    match s.guest_pair.enqueue(&data) {
                        Ok(n) => {
                            prop_assert!(free > 0);
                            prop_assert_eq!(n, len.min(free));
                            model.extend(&data[..n]);
                        }
                        Err(VmciError::NoSpace) => prop_assert_eq!(free, 0),
                        Err(err) => prop_assert!(false, "unexpected enqueue error: {}", err),
                    }
                }
                Op::Read(len) => {
                    let mut buf = vec![0u8; len];
                    match s.host_pair.dequeue(&mut buf) {
                        Ok(n) => {
                            prop_assert_eq!(n, len.min(model.len()));
                            let expected: Vec<u8> = model.drain(..n).collect();
                            prop_assert_eq!(&buf[..n], expected.as_slice());
                        }
                        Err(VmciError::NoData) => prop_assert!(model.is_empty()),
                        Err(err) => prop_assert!(false, "unexpected dequeue error: {}", err),
                    }
                }
            }

            let free = s.guest_pair.produce_free_space().unwrap();
            let ready = s.host_pair.consume_buf_ready().unwrap();
            prop_assert_eq!(free + ready, SIZE - 1);
            prop_assert_eq!(ready as usize, model.len());
        }
    }
}
