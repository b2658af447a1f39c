//! Queue pairs
//!
//! A [`QueuePair`] is one endpoint's view of a pair of rings: it produces
//! into one and consumes from the other. The endpoint owns references to the
//! queue mappings, never the memory; the broker frees the memory once both
//! endpoints have detached.
//!
//! Every data operation runs under the pair's body lock. Blocking pairs use
//! a sleeping mutex so that an operation finding the memory temporarily
//! unmapped can wait for the resume event; non-blocking pairs use a spin
//! lock and report `NotReady` instead.

use core::sync::atomic::{AtomicBool, Ordering};
use std::io::{IoSlice, IoSliceMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use crate::error::{Result, VmciError};
use crate::event::{Event, EventKind, SubscriptionId};
use crate::handle::{ContextId, Handle, INVALID_ID};
use crate::platform::QueuePairRequest;
use crate::queue::{MappedQueues, QueueMapping};
use crate::resource::ResourceKind;
use crate::route::{route, Route};
use crate::sync::ObjectMutex;
use crate::transport::Transport;

bitflags::bitflags! {
    /// Queue pair allocation flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueuePairFlags: u32 {
        /// Fail unless the pair already exists.
        const ATTACH_ONLY = 1 << 0;
        /// Never sleep waiting for memory.
        const NONBLOCK = 1 << 2;
    }
}

#[derive(Debug, Default)]
struct WaitState {
    generation: u64,
    blocked: u32,
}

enum BodyLock {
    Sleeping {
        state: Mutex<WaitState>,
        ready: Condvar,
    },
    Spinning(ObjectMutex<()>),
}

/// One endpoint of a queue pair.
pub struct QueuePair {
    handle: Handle,
    peer: ContextId,
    flags: QueuePairFlags,
    guest_side: bool,
    produce_size: u64,
    consume_size: u64,
    produce: Arc<QueueMapping>,
    consume: Arc<QueueMapping>,
    body: BodyLock,
    detached: AtomicBool,
    subscription: ObjectMutex<Option<SubscriptionId>>,
    transport: Weak<Transport>,
}

impl QueuePair {
    /// Create a queue pair, or attach to one with `ATTACH_ONLY`.
    ///
    /// `handle` may be invalid to let the broker pick one. `peer` is the
    /// context allowed to attach.
    pub fn alloc(
        transport: &Arc<Transport>,
        handle: Handle,
        produce_size: u64,
        consume_size: u64,
        peer: ContextId,
        flags: QueuePairFlags,
    ) -> Result<Arc<Self>> {
        if produce_size == 0 || consume_size == 0 {
            return Err(VmciError::InvalidArgs("queue sizes must be non-zero"));
        }
        let total = produce_size
            .checked_add(consume_size)
            .ok_or(VmciError::NoMem("queue pair size overflows"))?;
        if total > transport.config.queue_pair.max_memory {
            return Err(VmciError::NoMem("queue pair above memory ceiling"));
        }

        let mut src = Handle::INVALID;
        let dst = Handle::new(peer, INVALID_ID);
        let guest_side = match route(&transport.contexts, &mut src, &dst, false) {
            Ok(Route::AsGuest) => true,
            Ok(_) => false,
            Err(_) => transport.contexts.guest_active(),
        };

        let own = transport.own_cid();
        let request = QueuePairRequest {
            handle: if handle.is_invalid() {
                Handle::new(own, INVALID_ID)
            } else {
                handle
            },
            requester: own,
            peer,
            produce_size,
            consume_size,
            flags,
        };
        let allocation = transport.platform.alloc(&request)?;

        let mut flags = flags;
        if !transport.config.queue_pair.blocking {
            flags |= QueuePairFlags::NONBLOCK;
        }
        let body = if flags.contains(QueuePairFlags::NONBLOCK) {
            BodyLock::Spinning(ObjectMutex::new((), "qp_body"))
        } else {
            BodyLock::Sleeping {
                state: Mutex::new(WaitState::default()),
                ready: Condvar::new(),
            }
        };

        let pair = Arc::new(Self {
            handle: allocation.handle,
            peer,
            flags,
            guest_side,
            produce_size,
            consume_size,
            produce: allocation.produce,
            consume: allocation.consume,
            body,
            detached: AtomicBool::new(false),
            subscription: ObjectMutex::new(None, "qp_subscription"),
            transport: Arc::downgrade(transport),
        });

        let kind = pair.resource_kind();
        if let Err(err) = transport.resources.add(kind, pair.handle, Arc::clone(&pair)) {
            if let Err(detach_err) = transport.platform.detach(pair.handle, own) {
                tracing::warn!(handle = %pair.handle, %detach_err, "broker detach after failed registration");
            }
            return Err(err);
        }

        if !flags.contains(QueuePairFlags::NONBLOCK) {
            let weak = Arc::downgrade(&pair);
            let id = transport.events.subscribe(
                EventKind::QueuePairResumed,
                Arc::new(move |event: &Event| {
                    if let Some(pair) = weak.upgrade() {
                        if event.handle == pair.handle {
                            pair.wake_waiters();
                        }
                    }
                }),
            );
            *pair.subscription.lock() = Some(id);
        }

        tracing::debug!(
            handle = %pair.handle,
            peer,
            produce_size,
            consume_size,
            created = allocation.created,
            guest_side,
            "queue pair allocated"
        );
        Ok(pair)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn peer(&self) -> ContextId {
        self.peer
    }

    pub fn flags(&self) -> QueuePairFlags {
        self.flags
    }

    pub fn is_guest_side(&self) -> bool {
        self.guest_side
    }

    pub fn produce_size(&self) -> u64 {
        self.produce_size
    }

    pub fn consume_size(&self) -> u64 {
        self.consume_size
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn resource_kind(&self) -> ResourceKind {
        if self.guest_side {
            ResourceKind::QueuePairGuest
        } else {
            ResourceKind::QueuePairHost
        }
    }

    /// Run `op` with both queues mapped, under the body lock.
    fn run_locked<T>(&self, op: impl FnOnce(&MappedQueues) -> Result<T>) -> Result<T> {
        match &self.body {
            BodyLock::Spinning(lock) => {
                let _body = lock.lock();
                if self.is_detached() {
                    return Err(VmciError::Detached);
                }
                let queues = MappedQueues::map(&self.produce, &self.consume)?;
                op(&queues)
            }
            BodyLock::Sleeping { state, ready } => {
                let mut wait = state.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    if self.is_detached() {
                        return Err(VmciError::Detached);
                    }
                    match MappedQueues::map(&self.produce, &self.consume) {
                        Ok(queues) => return op(&queues),
                        Err(VmciError::NotReady) => {
                            wait.blocked += 1;
                            let generation = wait.generation;
                            tracing::trace!(handle = %self.handle, "waiting for queue pair memory");
                            wait = ready
                                .wait_while(wait, |w| {
                                    w.generation == generation && !self.is_detached()
                                })
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Wake every operation sleeping on unmapped memory.
    pub fn wake_waiters(&self) {
        if let BodyLock::Sleeping { state, ready } = &self.body {
            let mut wait = state.lock().unwrap_or_else(PoisonError::into_inner);
            if wait.blocked > 0 {
                tracing::trace!(handle = %self.handle, blocked = wait.blocked, "waking queue pair waiters");
            }
            wait.blocked = 0;
            wait.generation = wait.generation.wrapping_add(1);
            ready.notify_all();
        }
    }

    /// Number of operations currently sleeping on this pair.
    pub fn blocked_waiters(&self) -> u32 {
        match &self.body {
            BodyLock::Sleeping { state, .. } => {
                state.lock().unwrap_or_else(PoisonError::into_inner).blocked
            }
            BodyLock::Spinning(_) => 0,
        }
    }

    pub fn enqueue(&self, buf: &[u8]) -> Result<usize> {
        self.run_locked(|queues| queues.enqueue(buf))
    }

    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize> {
        self.run_locked(|queues| queues.dequeue(buf))
    }

    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        self.run_locked(|queues| queues.peek(buf))
    }

    pub fn enqueue_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.run_locked(|queues| queues.enqueue_vectored(bufs))
    }

    pub fn dequeue_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        self.run_locked(|queues| queues.dequeue_vectored(bufs))
    }

    pub fn peek_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        self.run_locked(|queues| queues.peek_vectored(bufs))
    }

    pub fn produce_free_space(&self) -> Result<u64> {
        self.run_locked(MappedQueues::produce_free_space)
    }

    pub fn produce_buf_ready(&self) -> Result<u64> {
        self.run_locked(MappedQueues::produce_buf_ready)
    }

    pub fn consume_free_space(&self) -> Result<u64> {
        self.run_locked(MappedQueues::consume_free_space)
    }

    pub fn consume_buf_ready(&self) -> Result<u64> {
        self.run_locked(MappedQueues::consume_buf_ready)
    }

    /// (producer tail, consumer head) of the produce queue.
    pub fn produce_indexes(&self) -> Result<(u64, u64)> {
        self.run_locked(MappedQueues::produce_indexes)
    }

    /// (producer tail, consumer head) of the consume queue.
    pub fn consume_indexes(&self) -> Result<(u64, u64)> {
        self.run_locked(MappedQueues::consume_indexes)
    }

    /// Leave the queue pair.
    ///
    /// Idempotent, and safe after the peer or the transport is gone.
    /// Sleeping operations wake up and fail with `Detached`.
    pub fn detach(&self) -> Result<()> {
        match self.transport.upgrade() {
            Some(transport) => self.release(&transport),
            None => {
                self.mark_detached();
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, transport: &Transport) -> Result<()> {
        if !self.mark_detached() {
            return Ok(());
        }

        if let Some(id) = self.subscription.lock().take() {
            // The subscription may already be gone if the bus was torn down
            let _ = transport.events.unsubscribe(id);
        }
        if let Err(err) = transport.resources.remove(self.handle, self.resource_kind()) {
            tracing::debug!(handle = %self.handle, %err, "queue pair was not registered");
        }

        tracing::debug!(handle = %self.handle, "queue pair detached");
        transport.platform.detach(self.handle, transport.own_cid())
    }

    /// Returns true for the call that performed the transition.
    fn mark_detached(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let BodyLock::Sleeping { state, ready } = &self.body {
            let mut wait = state.lock().unwrap_or_else(PoisonError::into_inner);
            wait.generation = wait.generation.wrapping_add(1);
            wait.blocked = 0;
            ready.notify_all();
        }
        true
    }
}

impl core::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueuePair")
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("flags", &self.flags)
            .field("produce_size", &self.produce_size)
            .field("consume_size", &self.consume_size)
            .field("detached", &self.is_detached())
            .finish()
    }
}
