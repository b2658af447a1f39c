//! Platform seams
//!
//! Everything below the transport (the hypercall surface of a guest device,
//! the context table and queue pair broker of a host device) is reached
//! through these traits. A transport holds exactly one [`Platform`].

use std::sync::Arc;

use crate::datagram::Datagram;
use crate::doorbell::NotificationBitmap;
use crate::error::Result;
use crate::handle::{ContextId, Handle, PrivilegeFlags};
use crate::qpair::QueuePairFlags;
use crate::queue::QueueMapping;

/// Datagram transmission below the router.
pub trait DatagramSender: Send + Sync {
    /// Hand a routed datagram to the device; returns the bytes accepted.
    fn send_datagram(&self, datagram: &Datagram) -> Result<usize>;
}

/// Doorbell plumbing.
pub trait DoorbellDevice: Send + Sync {
    /// Guest: bind a doorbell handle to a bitmap index.
    fn link(&self, handle: Handle, notify_idx: u32) -> Result<()>;

    /// Guest: drop a binding made by `link`.
    fn unlink(&self, handle: Handle) -> Result<()>;

    /// Guest: ring a doorbell that lives outside this VM.
    fn notify(&self, handle: Handle, priv_flags: PrivilegeFlags) -> Result<()>;

    /// Guest: share the notification bitmap with the device.
    fn register_bitmap(&self, bitmap: Arc<NotificationBitmap>) -> Result<()>;
}

/// Queue pair allocation request.
#[derive(Clone, Copy, Debug)]
pub struct QueuePairRequest {
    /// Requested handle; an invalid resource asks the broker to pick one.
    pub handle: Handle,
    /// Context of the endpoint making the request.
    pub requester: ContextId,
    /// Context allowed to attach as the other endpoint.
    pub peer: ContextId,
    pub produce_size: u64,
    pub consume_size: u64,
    pub flags: QueuePairFlags,
}

/// Broker answer: the queues as seen by the requester.
pub struct QueuePairAllocation {
    pub handle: Handle,
    pub produce: Arc<QueueMapping>,
    pub consume: Arc<QueueMapping>,
    /// True if this request created the pair, false if it attached.
    pub created: bool,
}

/// Queue pair broker.
pub trait QueuePairBroker: Send + Sync {
    /// Create a queue pair or attach to an existing one.
    fn alloc(&self, request: &QueuePairRequest) -> Result<QueuePairAllocation>;

    /// Leave a queue pair; the broker frees it when both endpoints are gone.
    fn detach(&self, handle: Handle, context: ContextId) -> Result<()>;
}

/// Everything a transport needs from below.
pub trait Platform: DatagramSender + DoorbellDevice + QueuePairBroker {}

impl<T: DatagramSender + DoorbellDevice + QueuePairBroker> Platform for T {}
