//! In-process loopback fabric
//!
//! [`Fabric`] plays the device, the hypervisor and the queue pair broker for
//! any number of transports living in one process: one host personality at
//! [`HOST_CONTEXT_ID`] and guests at VM context ids. Every transport reaches
//! the fabric through its own [`FabricPort`].
//!
//! Datagrams addressed to a VM's doorbell-notify resource never reach the
//! guest's handlers: the device consumes them and raises the doorbell's
//! bitmap index instead.
//!
//! Delivery is synchronous: a datagram, doorbell or broker event reaches the
//! target transport on the calling thread. The fabric lock is never held
//! while a transport is called.

use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::config::VmciConfig;
use crate::context::Personality;
use crate::datagram::Datagram;
use crate::doorbell::NotificationBitmap;
use crate::error::{Result, VmciError};
use crate::event::{Event, EventKind};
use crate::handle::{
    resource, ContextId, Handle, PrivilegeFlags, ResourceId, HOST_CONTEXT_ID, HYPERVISOR_CONTEXT_ID,
    INVALID_ID, RESERVED_RESOURCE_ID_MAX,
};
use crate::platform::{
    DatagramSender, DoorbellDevice, QueuePairAllocation, QueuePairBroker, QueuePairRequest,
};
use crate::qpair::QueuePairFlags;
use crate::queue::{QueueMapping, QueueRegion};
use crate::sync::TableMutex;
use crate::transport::Transport;

struct Endpoint {
    context: ContextId,
    produce: Arc<QueueMapping>,
    consume: Arc<QueueMapping>,
}

struct BrokerEntry {
    creator: ContextId,
    peer: ContextId,
    produce_size: u64,
    consume_size: u64,
    /// creator -> peer.
    forward: Arc<QueueRegion>,
    /// peer -> creator.
    backward: Arc<QueueRegion>,
    endpoints: Vec<Endpoint>,
}

impl BrokerEntry {
    fn endpoint(&self, context: ContextId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.context == context)
    }

    /// The regions `context` produces into and consumes from.
    fn regions_for(&self, context: ContextId) -> (Arc<QueueRegion>, Arc<QueueRegion>) {
        if context == self.creator {
            (Arc::clone(&self.forward), Arc::clone(&self.backward))
        } else {
            (Arc::clone(&self.backward), Arc::clone(&self.forward))
        }
    }
}

#[derive(Default)]
struct FabricState {
    transports: HashMap<ContextId, Weak<Transport>>,
    bitmaps: HashMap<ContextId, Arc<NotificationBitmap>>,
    links: HashMap<Handle, u32>,
    queue_pairs: HashMap<Handle, BrokerEntry>,
    next_qp_id: ResourceId,
}

/// Loopback hypervisor and broker.
pub struct Fabric {
    state: TableMutex<FabricState>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: TableMutex::new(
                FabricState {
                    next_qp_id: RESERVED_RESOURCE_ID_MAX + 1,
                    ..FabricState::default()
                },
                "loopback_fabric",
            ),
        })
    }

    /// Bring up a transport at `cid` wired to this fabric.
    pub fn attach(
        self: &Arc<Self>,
        config: VmciConfig,
        cid: ContextId,
        personality: Personality,
    ) -> Result<Arc<Transport>> {
        if self.transport(cid).is_some() {
            return Err(VmciError::AlreadyExists);
        }

        let port = Arc::new(FabricPort {
            fabric: Arc::clone(self),
            cid,
        });
        let transport = Transport::init(config, cid, personality, port)?;

        let guests: Vec<ContextId> = {
            let mut state = self.state.lock();
            state.transports.insert(cid, Arc::downgrade(&transport));
            state
                .transports
                .keys()
                .copied()
                .filter(|&other| other != HOST_CONTEXT_ID && other != cid)
                .collect()
        };

        if personality.contains(Personality::HOST) {
            for guest in guests {
                transport.context_added(guest);
            }
        } else if let Some(host) = self.transport(HOST_CONTEXT_ID) {
            host.context_added(cid);
        }

        tracing::debug!(cid, ?personality, "transport attached to loopback fabric");
        Ok(transport)
    }

    /// Host personality at the host context.
    pub fn host(self: &Arc<Self>, config: VmciConfig) -> Result<Arc<Transport>> {
        self.attach(config, HOST_CONTEXT_ID, Personality::HOST)
    }

    /// Guest personality at VM context `cid`.
    pub fn guest(self: &Arc<Self>, config: VmciConfig, cid: ContextId) -> Result<Arc<Transport>> {
        self.attach(config, cid, Personality::GUEST)
    }

    /// Unplug a guest: the host forgets its context.
    pub fn remove(&self, cid: ContextId) {
        {
            let mut state = self.state.lock();
            state.transports.remove(&cid);
            state.bitmaps.remove(&cid);
            state.links.retain(|handle, _| handle.context != cid);
        }
        if let Some(host) = self.transport(HOST_CONTEXT_ID) {
            host.context_removed(cid);
        }
    }

    fn transport(&self, cid: ContextId) -> Option<Arc<Transport>> {
        self.state.lock().transports.get(&cid).and_then(Weak::upgrade)
    }

    /// Take a queue pair endpoint's memory away, as a host losing a guest
    /// mapping would.
    pub fn unmap_queue_pair(&self, handle: Handle, context: ContextId) -> Result<()> {
        let state = self.state.lock();
        let endpoint = state
            .queue_pairs
            .get(&handle)
            .and_then(|entry| entry.endpoint(context))
            .ok_or(VmciError::NotFound)?;
        endpoint.produce.unmap();
        endpoint.consume.unmap();
        tracing::debug!(%handle, context, "queue pair unmapped");
        Ok(())
    }

    /// Restore an endpoint's memory and publish the resume event.
    pub fn remap_queue_pair(&self, handle: Handle, context: ContextId) -> Result<()> {
        {
            let state = self.state.lock();
            let entry = state.queue_pairs.get(&handle).ok_or(VmciError::NotFound)?;
            let endpoint = entry.endpoint(context).ok_or(VmciError::NotFound)?;
            let (produce, consume) = entry.regions_for(context);
            endpoint.produce.map(produce);
            endpoint.consume.map(consume);
        }
        tracing::debug!(%handle, context, "queue pair remapped");
        if let Some(transport) = self.transport(context) {
            transport.events().publish(Event {
                kind: EventKind::QueuePairResumed,
                handle,
                context,
            });
        }
        Ok(())
    }

    /// Forget every doorbell link of `cid`, as a device reset would.
    pub fn forget_links(&self, cid: ContextId) {
        self.state
            .lock()
            .links
            .retain(|handle, _| handle.context != cid);
    }

    /// Bitmap index a doorbell is linked at.
    pub fn linked_index(&self, handle: Handle) -> Option<u32> {
        self.state.lock().links.get(&handle).copied()
    }

    /// Mark a linked VM doorbell pending and interrupt its guest.
    fn ring(&self, handle: Handle) -> Result<()> {
        let (idx, bitmap) = {
            let state = self.state.lock();
            let idx = *state.links.get(&handle).ok_or(VmciError::NotFound)?;
            let bitmap = state
                .bitmaps
                .get(&handle.context)
                .cloned()
                .ok_or(VmciError::DeviceNotFound)?;
            (idx, bitmap)
        };
        bitmap.set(idx);
        if let Some(guest) = self.transport(handle.context) {
            guest.handle_interrupt();
        }
        Ok(())
    }

    /// Number of live broker entries.
    pub fn queue_pair_count(&self) -> usize {
        self.state.lock().queue_pairs.len()
    }

    fn allocate_qp_id(state: &mut FabricState, context: ContextId) -> Result<ResourceId> {
        let used: HashSet<ResourceId> = state
            .queue_pairs
            .keys()
            .filter(|handle| handle.context == context)
            .map(|handle| handle.resource)
            .collect();
        let start = state.next_qp_id;
        loop {
            let candidate = state.next_qp_id;
            state.next_qp_id = match state.next_qp_id.wrapping_add(1) {
                INVALID_ID => RESERVED_RESOURCE_ID_MAX + 1,
                next => next,
            };
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
            if state.next_qp_id == start {
                return Err(VmciError::NoMem("queue pair ids exhausted"));
            }
        }
    }

    fn alloc(&self, request: &QueuePairRequest) -> Result<QueuePairAllocation> {
        let mut state = self.state.lock();

        let handle = if request.handle.resource == INVALID_ID {
            if request.flags.contains(QueuePairFlags::ATTACH_ONLY) {
                return Err(VmciError::InvalidArgs("attach needs a queue pair handle"));
            }
            let resource = Self::allocate_qp_id(&mut state, request.handle.context)?;
            Handle::new(request.handle.context, resource)
        } else {
            request.handle
        };

        if let Some(entry) = state.queue_pairs.get_mut(&handle) {
            if entry.endpoint(request.requester).is_some() || entry.endpoints.len() >= 2 {
                return Err(VmciError::AlreadyExists);
            }
            if entry.peer != INVALID_ID && entry.peer != request.requester {
                return Err(VmciError::NoAccess);
            }
            if request.produce_size != entry.consume_size
                || request.consume_size != entry.produce_size
            {
                return Err(VmciError::InvalidArgs("queue sizes do not match the creator"));
            }

            let (produce, consume) = entry.regions_for(request.requester);
            let endpoint = Endpoint {
                context: request.requester,
                produce: QueueMapping::mapped(produce),
                consume: QueueMapping::mapped(consume),
            };
            let allocation = QueuePairAllocation {
                handle,
                produce: Arc::clone(&endpoint.produce),
                consume: Arc::clone(&endpoint.consume),
                created: false,
            };
            entry.endpoints.push(endpoint);
            let creator = entry.creator;
            drop(state);

            if let Some(transport) = self.transport(creator) {
                transport.events().publish(Event {
                    kind: EventKind::QueuePairPeerAttach,
                    handle,
                    context: request.requester,
                });
            }
            return Ok(allocation);
        }

        if request.flags.contains(QueuePairFlags::ATTACH_ONLY) {
            return Err(VmciError::NotFound);
        }

        let forward = QueueRegion::new(handle, request.produce_size)?;
        let backward = QueueRegion::new(handle, request.consume_size)?;
        let endpoint = Endpoint {
            context: request.requester,
            produce: QueueMapping::mapped(Arc::clone(&forward)),
            consume: QueueMapping::mapped(Arc::clone(&backward)),
        };
        let allocation = QueuePairAllocation {
            handle,
            produce: Arc::clone(&endpoint.produce),
            consume: Arc::clone(&endpoint.consume),
            created: true,
        };
        state.queue_pairs.insert(
            handle,
            BrokerEntry {
                creator: request.requester,
                peer: request.peer,
                produce_size: request.produce_size,
                consume_size: request.consume_size,
                forward,
                backward,
                endpoints: vec![endpoint],
            },
        );
        Ok(allocation)
    }

    fn detach(&self, handle: Handle, context: ContextId) -> Result<()> {
        let remaining = {
            let mut state = self.state.lock();
            let entry = state.queue_pairs.get_mut(&handle).ok_or(VmciError::NotFound)?;
            let before = entry.endpoints.len();
            entry.endpoints.retain(|e| e.context != context);
            if entry.endpoints.len() == before {
                return Err(VmciError::NotFound);
            }
            let remaining: Vec<ContextId> = entry.endpoints.iter().map(|e| e.context).collect();
            if remaining.is_empty() {
                state.queue_pairs.remove(&handle);
            }
            remaining
        };

        for other in remaining {
            if let Some(transport) = self.transport(other) {
                transport.events().publish(Event {
                    kind: EventKind::QueuePairPeerDetach,
                    handle,
                    context,
                });
            }
        }
        Ok(())
    }
}

/// One transport's connection to the fabric.
pub struct FabricPort {
    fabric: Arc<Fabric>,
    cid: ContextId,
}

impl DatagramSender for FabricPort {
    fn send_datagram(&self, datagram: &Datagram) -> Result<usize> {
        if datagram.dst.context == HYPERVISOR_CONTEXT_ID {
            return Err(VmciError::Unreachable);
        }
        if datagram.dst.context == HOST_CONTEXT_ID || self.cid != HOST_CONTEXT_ID {
            let host = self
                .fabric
                .transport(HOST_CONTEXT_ID)
                .ok_or(VmciError::Unreachable)?;
            host.datagram_dispatch(self.cid, datagram.clone())
        } else if datagram.dst.resource == resource::DOORBELL_NOTIFY {
            let handle = Handle::from_le_bytes(&datagram.payload)
                .ok_or(VmciError::InvalidArgs("doorbell notify without a handle"))?;
            if handle.context != datagram.dst.context {
                return Err(VmciError::InvalidArgs("doorbell outside the notified context"));
            }
            self.fabric.ring(handle)?;
            Ok(datagram.total_size())
        } else {
            let guest = self
                .fabric
                .transport(datagram.dst.context)
                .ok_or(VmciError::Unreachable)?;
            guest.datagram_deliver(datagram)
        }
    }
}

impl DoorbellDevice for FabricPort {
    fn link(&self, handle: Handle, notify_idx: u32) -> Result<()> {
        let mut state = self.fabric.state.lock();
        if state.links.contains_key(&handle) {
            return Err(VmciError::DuplicateEntry);
        }
        state.links.insert(handle, notify_idx);
        Ok(())
    }

    fn unlink(&self, handle: Handle) -> Result<()> {
        self.fabric
            .state
            .lock()
            .links
            .remove(&handle)
            .map(|_| ())
            .ok_or(VmciError::NotFound)
    }

    fn notify(&self, handle: Handle, priv_flags: PrivilegeFlags) -> Result<()> {
        let host = self
            .fabric
            .transport(HOST_CONTEXT_ID)
            .ok_or(VmciError::Unreachable)?;
        host.host_notify(handle, priv_flags)
    }

    fn register_bitmap(&self, bitmap: Arc<NotificationBitmap>) -> Result<()> {
        self.fabric.state.lock().bitmaps.insert(self.cid, bitmap);
        Ok(())
    }
}

impl QueuePairBroker for FabricPort {
    fn alloc(&self, request: &QueuePairRequest) -> Result<QueuePairAllocation> {
        self.fabric.alloc(request)
    }

    fn detach(&self, handle: Handle, context: ContextId) -> Result<()> {
        self.fabric.detach(handle, context)
    }
}
