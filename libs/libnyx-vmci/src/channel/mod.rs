//! Packet/page channel
//!
//! A connection-oriented packet protocol on top of one queue pair, one
//! doorbell per side and a bootstrap datagram handle per side.
//!
//! ## Handshake
//!
//! ```text
//!  initiator (guest)                          acceptor (host)
//!  ----------------                           ---------------
//!  datagram + doorbell + queue pair
//!  SetRecvBuffer* ------- datagram -------->  delivered to client
//!  GuestConnect --------- datagram -------->  doorbell
//!                <------- datagram ---------  HyperConnect
//!  (peer attach event)  <------------------   queue pair attach
//!  Connected            <--- queue pair ----  SetRecvBuffer*, Connected
//! ```
//!
//! ## Flow control
//!
//! Each side tracks how many receive buffers it has posted to the peer
//! (`cur_recv_buffers`) against a target. Every `Data` packet consumes
//! `num_elems` buffers; whenever the count drops below `target - threshold`
//! the side posts enough buffers to reach `target + threshold`. The peer can
//! ask for a higher target with `RequestBuffer`, up to `max_recv_buffers`.

mod packet;

pub use packet::{
    GuestConnectMessage, HyperConnectMessage, Packet, PacketHeader, PacketType, SgElem,
};

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::config::ChannelConfig;
use crate::datagram::Datagram;
use crate::doorbell::DoorbellFlags;
use crate::error::{Result, VmciError};
use crate::event::{Event, EventKind, SubscriptionId};
use crate::handle::{Handle, PrivilegeFlags, ResourceId, HOST_CONTEXT_ID};
use crate::qpair::{QueuePair, QueuePairFlags};
use crate::sync::ObjectMutex;
use crate::transport::Transport;

bitflags::bitflags! {
    /// Channel behaviour flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        /// Only tell the client that the doorbell rang; it drains itself.
        const NOTIFY_ONLY = 1 << 0;
        /// Receive on the transport worker instead of the notifying thread.
        const RECV_DELAYED = 1 << 1;
    }
}

/// Connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Free,
}

/// Which end of the handshake this channel plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Acceptor,
}

/// Channel consumer.
///
/// Callbacks run on the thread that rang the doorbell (or the transport
/// worker with `RECV_DELAYED`) and must not destroy the channel.
pub trait ChannelClient: Send + Sync {
    /// Allocate up to `count` receive buffers; returning fewer means the
    /// pool is exhausted.
    fn alloc_elems(&self, count: usize) -> Vec<SgElem>;

    /// Return buffers that will never be handed to the peer.
    fn free_elems(&self, elems: &[SgElem]);

    /// A packet arrived.
    fn on_packet(&self, packet: &Packet);

    /// Notify-only channels: the doorbell rang.
    fn on_notify(&self) {}
}

/// Initiator connection parameters.
#[derive(Clone, Copy, Debug)]
pub struct ChannelParams {
    /// Our datagram resource, `INVALID_ID` to allocate one.
    pub resource: ResourceId,
    /// The acceptor's datagram resource in the host context.
    pub peer_resource: ResourceId,
    pub produce_size: u64,
    pub consume_size: u64,
    pub flags: ChannelFlags,
}

#[derive(Clone, Copy)]
enum Via {
    Datagram,
    QueuePair,
}

struct Links {
    state: ChannelState,
    dgram_handle: Handle,
    peer_dgram_handle: Handle,
    doorbell_handle: Handle,
    peer_doorbell_handle: Handle,
    queue_pair: Option<Arc<QueuePair>>,
    subscriptions: Vec<SubscriptionId>,
}

/// One end of a page channel.
pub struct PageChannel {
    transport: Arc<Transport>,
    role: ChannelRole,
    flags: ChannelFlags,
    settings: ChannelConfig,
    client: Arc<dyn ChannelClient>,
    links: ObjectMutex<Links>,
    send_lock: Mutex<()>,
    cur_recv_buffers: AtomicI32,
    recv_buffers_target: AtomicI32,
    in_poll: AtomicBool,
    signal_pending: AtomicBool,
}

impl PageChannel {
    fn new(
        transport: &Arc<Transport>,
        role: ChannelRole,
        flags: ChannelFlags,
        client: Arc<dyn ChannelClient>,
    ) -> Arc<Self> {
        let settings = transport.config().channel.clone();
        Arc::new(Self {
            transport: Arc::clone(transport),
            role,
            flags,
            recv_buffers_target: AtomicI32::new(settings.default_recv_buffers as i32),
            settings,
            client,
            links: ObjectMutex::new(
                Links {
                    state: ChannelState::Unconnected,
                    dgram_handle: Handle::INVALID,
                    peer_dgram_handle: Handle::INVALID,
                    doorbell_handle: Handle::INVALID,
                    peer_doorbell_handle: Handle::INVALID,
                    queue_pair: None,
                    subscriptions: Vec::new(),
                },
                "channel_links",
            ),
            send_lock: Mutex::new(()),
            cur_recv_buffers: AtomicI32::new(0),
            in_poll: AtomicBool::new(false),
            signal_pending: AtomicBool::new(false),
        })
    }

    /// Open a channel to a host acceptor.
    ///
    /// Creates the datagram handle, doorbell and queue pair, posts the
    /// initial receive buffers and sends `GuestConnect`. The channel becomes
    /// `Connected` once the acceptor attaches to the queue pair.
    pub fn create(
        transport: &Arc<Transport>,
        params: ChannelParams,
        client: Arc<dyn ChannelClient>,
    ) -> Result<Arc<Self>> {
        let channel = Self::new(transport, ChannelRole::Initiator, params.flags, client);
        if let Err(err) = channel.connect(&params) {
            tracing::warn!(%err, "page channel creation failed");
            channel.destroy();
            return Err(err);
        }
        Ok(channel)
    }

    /// Wait for a guest to connect on host datagram resource `resource`.
    pub fn listen(
        transport: &Arc<Transport>,
        resource: ResourceId,
        flags: ChannelFlags,
        client: Arc<dyn ChannelClient>,
    ) -> Result<Arc<Self>> {
        let channel = Self::new(transport, ChannelRole::Acceptor, flags, client);
        let dgram = channel.create_datagram(resource)?;
        tracing::debug!(%dgram, "page channel listening");
        Ok(channel)
    }

    fn connect(self: &Arc<Self>, params: &ChannelParams) -> Result<()> {
        self.create_datagram(params.resource)?;
        self.links.lock().peer_dgram_handle = Handle::new(HOST_CONTEXT_ID, params.peer_resource);

        self.subscribe(EventKind::QueuePairPeerAttach);
        self.subscribe(EventKind::QueuePairPeerDetach);

        let doorbell = self.create_doorbell()?;
        let pair = QueuePair::alloc(
            &self.transport,
            Handle::INVALID,
            params.produce_size,
            params.consume_size,
            HOST_CONTEXT_ID,
            QueuePairFlags::empty(),
        )?;
        let qp_handle = pair.handle();
        let dgram_handle = {
            let mut links = self.links.lock();
            links.queue_pair = Some(pair);
            links.state = ChannelState::Connecting;
            links.dgram_handle
        };

        self.add_recv_buffers(self.settings.default_recv_buffers as usize, Via::Datagram)?;

        let message = GuestConnectMessage {
            dgram_handle,
            qp_handle,
            produce_size: params.produce_size,
            consume_size: params.consume_size,
            doorbell_handle: doorbell,
        };
        self.send_datagram(&Packet::new(PacketType::GuestConnect, message.encode(), Vec::new()))?;
        tracing::debug!(%qp_handle, %doorbell, "page channel connecting");
        Ok(())
    }

    fn create_datagram(self: &Arc<Self>, resource: ResourceId) -> Result<Handle> {
        let weak = Arc::downgrade(self);
        let handle = self.transport.datagram_create(
            resource,
            Arc::new(move |datagram: &Datagram| {
                if let Some(channel) = weak.upgrade() {
                    channel.on_datagram(datagram);
                }
            }),
        )?;
        self.links.lock().dgram_handle = handle;
        Ok(handle)
    }

    fn create_doorbell(self: &Arc<Self>) -> Result<Handle> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let flags = if self.flags.contains(ChannelFlags::RECV_DELAYED) {
            DoorbellFlags::DELAYED_CB
        } else {
            DoorbellFlags::empty()
        };
        let handle = self.transport.doorbell_create(
            Handle::INVALID,
            flags,
            PrivilegeFlags::empty(),
            Arc::new(move || {
                if let Some(channel) = weak.upgrade() {
                    channel.poll();
                }
            }),
        )?;
        self.links.lock().doorbell_handle = handle;
        Ok(handle)
    }

    fn subscribe(self: &Arc<Self>, kind: EventKind) {
        let weak = Arc::downgrade(self);
        let id = self.transport.events().subscribe(
            kind,
            Arc::new(move |event: &Event| {
                if let Some(channel) = weak.upgrade() {
                    channel.on_event(event);
                }
            }),
        );
        self.links.lock().subscriptions.push(id);
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.links.lock().state
    }

    pub fn dgram_handle(&self) -> Handle {
        self.links.lock().dgram_handle
    }

    pub fn doorbell_handle(&self) -> Handle {
        self.links.lock().doorbell_handle
    }

    pub fn peer_doorbell_handle(&self) -> Handle {
        self.links.lock().peer_doorbell_handle
    }

    pub fn queue_pair(&self) -> Option<Arc<QueuePair>> {
        self.links.lock().queue_pair.clone()
    }

    /// Receive buffers currently posted to the peer.
    pub fn cur_recv_buffers(&self) -> i32 {
        self.cur_recv_buffers.load(Ordering::Acquire)
    }

    pub fn recv_buffers_target(&self) -> i32 {
        self.recv_buffers_target.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ChannelState) {
        let mut links = self.links.lock();
        if links.state != ChannelState::Free {
            tracing::debug!(from = ?links.state, to = ?state, "page channel state change");
            links.state = state;
        }
    }

    /// Send one packet over the queue pair.
    pub fn send(&self, kind: PacketType, message: &[u8], elems: &[SgElem]) -> Result<()> {
        self.ensure_connected()?;
        check_client_type(kind)?;
        self.check_elems(elems.len())?;
        self.send_packet(&Packet::new(kind, message.to_vec(), elems.to_vec()), true)
    }

    /// Send several packets and ring the peer at most once.
    ///
    /// Stops at the first failure; returns the number of packets sent.
    pub fn send_batch(&self, packets: &[Packet]) -> Result<usize> {
        self.ensure_connected()?;
        let mut sent = 0;
        let result = packets.iter().try_for_each(|packet| {
            check_client_type(packet.kind)?;
            self.check_elems(packet.elems.len())?;
            self.send_packet(packet, false)?;
            sent += 1;
            Ok(())
        });
        self.flush();
        result.map(|()| sent)
    }

    /// Ring the peer if a batched send left it unsignalled.
    pub fn flush(&self) {
        if self.signal_pending.swap(false, Ordering::AcqRel) {
            self.signal_peer();
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ChannelState::Connected => Ok(()),
            _ => Err(VmciError::InvalidState("channel not connected")),
        }
    }

    fn check_elems(&self, count: usize) -> Result<()> {
        if count > self.settings.max_elems_per_packet as usize {
            return Err(VmciError::InvalidArgs("too many elements in one packet"));
        }
        Ok(())
    }

    fn send_packet(&self, packet: &Packet, signal_now: bool) -> Result<()> {
        let pair = self
            .queue_pair()
            .ok_or(VmciError::InvalidState("channel has no queue pair"))?;
        let bytes = packet.encode();

        let went_non_empty = {
            let _send = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let free = pair.produce_free_space()?;
            if free < bytes.len() as u64 {
                return Err(VmciError::NoMem("queue pair has no room for packet"));
            }
            let sent = pair.enqueue(&bytes)?;
            if sent != bytes.len() {
                tracing::error!(sent, len = bytes.len(), "partial packet enqueued");
                return Err(VmciError::NoSpace);
            }
            pair.produce_buf_ready()? == sent as u64
        };

        // Only an empty-to-non-empty transition needs a wakeup; the peer
        // drains everything it finds once woken.
        if went_non_empty {
            if signal_now {
                self.signal_peer();
            } else {
                self.signal_pending.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn signal_peer(&self) {
        let (peer, state) = {
            let links = self.links.lock();
            (links.peer_doorbell_handle, links.state)
        };
        if peer.is_invalid() {
            return;
        }
        if let Err(err) = self.transport.doorbell_notify(peer, PrivilegeFlags::empty()) {
            if state == ChannelState::Connected {
                tracing::warn!(%peer, %err, "failed to notify peer doorbell");
            } else {
                tracing::debug!(%peer, %err, "peer doorbell notify failed");
            }
        }
    }

    fn send_datagram(&self, packet: &Packet) -> Result<()> {
        let (dst, src) = {
            let links = self.links.lock();
            (links.peer_dgram_handle, links.dgram_handle)
        };
        if dst.is_invalid() {
            return Err(VmciError::InvalidState("peer datagram handle unknown"));
        }
        self.transport
            .datagram_send(Datagram::new(dst, src, packet.encode()))
            .map(|_| ())
    }

    fn send_control(&self, packet: &Packet, via: Via) -> Result<()> {
        match via {
            Via::Datagram => self.send_datagram(packet),
            Via::QueuePair => self.send_packet(packet, true),
        }
    }

    /// Post `count` receive buffers to the peer.
    fn add_recv_buffers(&self, count: usize, via: Via) -> Result<()> {
        let mut chunk = self.settings.max_elems_per_packet as usize;
        if let Via::Datagram = via {
            let room = self
                .transport
                .config()
                .datagram
                .max_payload
                .saturating_sub(PacketHeader::SIZE)
                / SgElem::WIRE_SIZE;
            chunk = chunk.min(room);
        }
        if chunk == 0 {
            return Err(VmciError::NoMem("no room for receive buffers"));
        }

        let mut remaining = count;
        while remaining > 0 {
            let want = remaining.min(chunk);
            let elems = self.client.alloc_elems(want);
            if elems.is_empty() {
                return Err(VmciError::NoMem("receive buffer allocation failed"));
            }
            let allocated = elems.len().min(want);
            let packet = Packet::new(PacketType::SetRecvBuffer, Vec::new(), elems);

            if let Err(err) = self.send_control(&packet, via) {
                self.client.free_elems(&packet.elems);
                return Err(err);
            }
            self.cur_recv_buffers.fetch_add(allocated as i32, Ordering::AcqRel);
            remaining -= allocated;

            if allocated < want {
                return Err(VmciError::NoMem("receive buffer pool exhausted"));
            }
        }
        Ok(())
    }

    fn top_up_recv_buffers(&self) {
        if self.state() != ChannelState::Connected {
            return;
        }
        let threshold = self.settings.recv_threshold as i32;
        let target = self.recv_buffers_target();
        let cur = self.cur_recv_buffers();
        if cur < target - threshold {
            let count = (target + threshold - cur) as usize;
            if let Err(err) = self.add_recv_buffers(count, Via::QueuePair) {
                tracing::debug!(%err, cur, target, "receive buffer top-up deferred");
            }
        }
    }

    /// Doorbell callback: drain the consume queue.
    pub fn poll(&self) {
        if self.flags.contains(ChannelFlags::NOTIFY_ONLY) {
            self.client.on_notify();
            return;
        }

        loop {
            if self
                .in_poll
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.drain();
            self.in_poll.store(false, Ordering::Release);

            // A notification that raced with the end of the drain found
            // `in_poll` set and returned; pick up what it left behind.
            if !self.packet_pending() {
                return;
            }
        }
    }

    fn packet_pending(&self) -> bool {
        self.queue_pair()
            .and_then(|pair| pair.consume_buf_ready().ok())
            .is_some_and(|ready| ready >= PacketHeader::SIZE as u64)
    }

    fn drain(&self) {
        let Some(pair) = self.queue_pair() else {
            return;
        };

        loop {
            let ready = match pair.consume_buf_ready() {
                Ok(ready) => ready,
                Err(err) => {
                    tracing::debug!(%err, "consume queue unavailable");
                    return;
                }
            };
            if ready < PacketHeader::SIZE as u64 {
                return;
            }

            let mut raw = [0u8; PacketHeader::SIZE];
            match pair.peek(&mut raw) {
                Ok(n) if n == PacketHeader::SIZE => {}
                _ => return,
            }
            let header = match PacketHeader::parse(&raw) {
                Ok(header) => header,
                Err(err) => {
                    self.discard(&pair, ready, &err);
                    return;
                }
            };

            let total = header.total_size();
            if total >= pair.consume_size() || header.num_elems > self.settings.max_elems_per_packet {
                self.discard(&pair, ready, &VmciError::Protocol("oversized packet"));
                return;
            }
            if ready < total {
                return;
            }

            let mut buf = vec![0u8; total as usize];
            match pair.dequeue(&mut buf) {
                Ok(n) if n as u64 == total => {}
                Ok(n) => {
                    tracing::warn!(n, total, "short packet dequeue");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%err, "packet dequeue failed");
                    return;
                }
            }

            match Packet::decode(&buf) {
                Ok(packet) => self.recv_packet(packet),
                Err(err) => tracing::warn!(%err, "dropping malformed packet"),
            }
        }
    }

    /// Drop everything currently queued after a framing error.
    fn discard(&self, pair: &QueuePair, ready: u64, cause: &VmciError) {
        tracing::error!(%cause, ready, "corrupt consume queue, discarding");
        let mut scratch = vec![0u8; ready.min(4096) as usize];
        let mut left = ready;
        while left > 0 {
            match pair.dequeue(&mut scratch) {
                Ok(n) => left = left.saturating_sub(n as u64),
                Err(_) => return,
            }
        }
    }

    fn on_datagram(self: &Arc<Self>, datagram: &Datagram) {
        let packet = match Packet::decode(&datagram.payload) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(src = %datagram.src, %err, "dropping malformed datagram");
                return;
            }
        };

        let expected = self.links.lock().peer_dgram_handle;
        if expected.is_valid() && datagram.src != expected {
            tracing::warn!(src = %datagram.src, %expected, "datagram from unexpected peer");
            return;
        }

        match (self.role, packet.kind) {
            (ChannelRole::Acceptor, PacketType::GuestConnect) => self.accept(datagram.src, &packet),
            (ChannelRole::Initiator, PacketType::HyperConnect) => {
                match HyperConnectMessage::decode(&packet.message) {
                    Ok(message) => {
                        self.links.lock().peer_doorbell_handle = message.doorbell_handle;
                        tracing::debug!(peer = %message.doorbell_handle, "peer doorbell learned");
                    }
                    Err(err) => tracing::warn!(%err, "bad connect reply"),
                }
            }
            _ => self.recv_packet(packet),
        }
    }

    fn accept(self: &Arc<Self>, src: Handle, packet: &Packet) {
        let message = match GuestConnectMessage::decode(&packet.message) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%src, %err, "bad connect request");
                return;
            }
        };

        {
            let mut links = self.links.lock();
            if links.state != ChannelState::Unconnected {
                tracing::warn!(%src, state = ?links.state, "connect request on busy channel");
                return;
            }
            links.state = ChannelState::Connecting;
            links.peer_dgram_handle = message.dgram_handle;
            links.peer_doorbell_handle = message.doorbell_handle;
        }

        if let Err(err) = self.complete_accept(src, &message) {
            tracing::warn!(%src, %err, "page channel accept failed");
            self.set_state(ChannelState::Disconnected);
        }
    }

    fn complete_accept(self: &Arc<Self>, src: Handle, message: &GuestConnectMessage) -> Result<()> {
        let doorbell = self.create_doorbell()?;
        let reply = HyperConnectMessage { doorbell_handle: doorbell };
        self.send_datagram(&Packet::new(PacketType::HyperConnect, reply.encode(), Vec::new()))?;

        self.subscribe(EventKind::QueuePairPeerDetach);
        let pair = QueuePair::alloc(
            &self.transport,
            message.qp_handle,
            message.consume_size,
            message.produce_size,
            src.context,
            QueuePairFlags::ATTACH_ONLY,
        )?;
        let qp_handle = pair.handle();
        {
            let mut links = self.links.lock();
            links.queue_pair = Some(pair);
            links.state = ChannelState::Connected;
        }
        tracing::debug!(%qp_handle, peer = src.context, "page channel accepted");

        if let Err(err) = self.add_recv_buffers(self.settings.default_recv_buffers as usize, Via::QueuePair) {
            tracing::debug!(%err, "initial receive buffers incomplete");
        }
        Ok(())
    }

    fn on_event(&self, event: &Event) {
        let ours = self
            .links
            .lock()
            .queue_pair
            .as_ref()
            .is_some_and(|pair| pair.handle() == event.handle);
        if !ours {
            return;
        }

        match event.kind {
            EventKind::QueuePairPeerAttach => {
                let mut links = self.links.lock();
                if links.state == ChannelState::Connecting {
                    links.state = ChannelState::Connected;
                    tracing::debug!(handle = %event.handle, "page channel connected");
                }
            }
            EventKind::QueuePairPeerDetach => self.set_state(ChannelState::Disconnected),
            _ => {}
        }
    }

    fn recv_packet(&self, packet: Packet) {
        match packet.kind {
            PacketType::Data => {
                self.cur_recv_buffers
                    .fetch_sub(packet.elems.len() as i32, Ordering::AcqRel);
                self.client.on_packet(&packet);
            }
            PacketType::SetRecvBuffer | PacketType::CompletionNotify => {
                self.client.on_packet(&packet);
            }
            PacketType::RequestBuffer => {
                let step = self.settings.default_recv_buffers as i32;
                let max = self.settings.max_recv_buffers as i32;
                let target = self
                    .recv_buffers_target
                    .load(Ordering::Acquire)
                    .saturating_add(step)
                    .min(max);
                self.recv_buffers_target.store(target, Ordering::Release);
                tracing::debug!(target, "peer requested more receive buffers");
            }
            PacketType::HyperDisconnect if self.role == ChannelRole::Initiator => {
                self.client.free_elems(&packet.elems);
                if let Err(err) = self.send_datagram(&Packet::control(PacketType::GuestDisconnect)) {
                    tracing::warn!(%err, "failed to acknowledge disconnect");
                }
                self.set_state(ChannelState::Disconnecting);
            }
            PacketType::GuestDisconnect if self.role == ChannelRole::Acceptor => {
                self.set_state(ChannelState::Disconnected);
            }
            kind => {
                tracing::warn!(?kind, role = ?self.role, "unexpected packet dropped");
                return;
            }
        }
        self.top_up_recv_buffers();
    }

    /// Acceptor: ask the guest to disconnect.
    pub fn disconnect(&self) -> Result<()> {
        if self.role != ChannelRole::Acceptor {
            return Err(VmciError::InvalidState("only the acceptor initiates disconnect"));
        }
        if self.state() != ChannelState::Connected {
            return Err(VmciError::InvalidState("channel not connected"));
        }
        self.set_state(ChannelState::Disconnecting);
        self.send_datagram(&Packet::control(PacketType::HyperDisconnect))
    }

    /// Release the queue pair, doorbell and datagram handle.
    ///
    /// Valid from any state and idempotent. Must not be called from a
    /// client callback.
    pub fn destroy(&self) {
        let (pair, doorbell, dgram, subscriptions) = {
            let mut links = self.links.lock();
            if links.state == ChannelState::Free {
                return;
            }
            links.state = ChannelState::Free;
            (
                links.queue_pair.take(),
                core::mem::replace(&mut links.doorbell_handle, Handle::INVALID),
                core::mem::replace(&mut links.dgram_handle, Handle::INVALID),
                core::mem::take(&mut links.subscriptions),
            )
        };

        for id in subscriptions {
            if let Err(err) = self.transport.events().unsubscribe(id) {
                tracing::debug!(%err, "channel subscription already gone");
            }
        }
        if let Some(pair) = pair {
            if let Err(err) = pair.detach() {
                tracing::warn!(handle = %pair.handle(), %err, "queue pair detach failed");
            }
        }
        if doorbell.is_valid() {
            if let Err(err) = self.transport.doorbell_destroy(doorbell) {
                tracing::warn!(%doorbell, %err, "doorbell destroy failed");
            }
        }
        if dgram.is_valid() {
            if let Err(err) = self.transport.datagram_destroy(dgram) {
                tracing::warn!(%dgram, %err, "datagram handle destroy failed");
            }
        }
        tracing::debug!(role = ?self.role, "page channel destroyed");
    }
}

fn check_client_type(kind: PacketType) -> Result<()> {
    if !kind.is_client_payload() {
        return Err(VmciError::InvalidArgs("packet type reserved for the channel"));
    }
    Ok(())
}
