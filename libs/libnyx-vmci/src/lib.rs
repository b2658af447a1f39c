//! # libnyx-vmci
//!
//! Guest/host communication transport for Nyx virtual machines.
//!
//! ## Layers
//!
//! - **Handles and routing** - `(context, resource)` addressing and the
//!   decision of which personality carries a message
//! - **Datagrams** - small routed messages delivered to registered handlers
//! - **Doorbells** - notification endpoints fired through a shared bitmap
//! - **Queue pairs** - a pair of lock-free single-producer ring buffers in
//!   shared memory
//! - **Page channel** - a packet protocol over a queue pair, with receive
//!   buffer accounting and doorbell-driven delivery
//!
//! All device and hypervisor access goes through the [`platform`] traits.
//! [`loopback::Fabric`] implements them in-process.
//!
//! ## Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use libnyx_vmci::{Datagram, Fabric, Handle, VmciConfig};
//! use libnyx_vmci::handle::{HOST_CONTEXT_ID, INVALID_ID};
//!
//! let fabric = Fabric::new();
//! let host = fabric.host(VmciConfig::default())?;
//! let guest = fabric.guest(VmciConfig::default(), 10)?;
//!
//! let inbox = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&inbox);
//! let service = host.datagram_create(
//!     3000,
//!     Arc::new(move |dg: &Datagram| sink.lock().unwrap().push(dg.payload.clone())),
//! )?;
//!
//! guest.datagram_send(Datagram::new(service, Handle::new(INVALID_ID, 42), b"ping".to_vec()))?;
//! assert_eq!(inbox.lock().unwrap().as_slice(), &[b"ping".to_vec()]);
//! assert_eq!(service.context, HOST_CONTEXT_ID);
//! # Ok::<(), libnyx_vmci::VmciError>(())
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod datagram;
pub mod doorbell;
pub mod error;
pub mod event;
pub mod handle;
pub mod loopback;
pub mod platform;
pub mod qpair;
pub mod queue;
pub mod resource;
pub mod route;
pub mod sync;
pub mod transport;
pub mod workqueue;

pub use channel::{
    ChannelClient, ChannelFlags, ChannelParams, ChannelRole, ChannelState, Packet, PacketType,
    PageChannel, SgElem,
};
pub use config::VmciConfig;
pub use context::Personality;
pub use datagram::{Datagram, DatagramCallback};
pub use doorbell::{DoorbellCallback, DoorbellFlags};
pub use error::{Result, VmciError};
pub use event::{Event, EventKind};
pub use handle::{ContextId, Handle, PrivilegeFlags, ResourceId};
pub use loopback::Fabric;
pub use platform::Platform;
pub use qpair::{QueuePair, QueuePairFlags};
pub use route::Route;
pub use transport::Transport;
