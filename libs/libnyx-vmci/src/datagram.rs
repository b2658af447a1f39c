//! Datagram handlers
//!
//! Datagrams are the bootstrap path: small, connectionless messages routed by
//! handle. They carry queue pair handshakes and doorbell control traffic
//! before (or instead of) a queue pair.

use std::sync::Arc;

use crate::error::{Result, VmciError};
use crate::handle::{ContextId, Handle, ResourceId, HOST_CONTEXT_ID, INVALID_ID};
use crate::resource::ResourceKind;
use crate::route::{route, Route};
use crate::transport::Transport;

/// A routed datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub dst: Handle,
    pub src: Handle,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// dst, src and payload size.
    pub const HEADER_SIZE: usize = 2 * Handle::WIRE_SIZE + 8;

    pub fn new(dst: Handle, src: Handle, payload: Vec<u8>) -> Self {
        Self { dst, src, payload }
    }

    pub fn total_size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Device wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(&self.dst.to_le_bytes());
        out.extend_from_slice(&self.src.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(VmciError::Protocol("datagram shorter than its header"));
        }
        let dst = Handle::from_le_bytes(&buf[0..8]).ok_or(VmciError::Protocol("datagram dst"))?;
        let src = Handle::from_le_bytes(&buf[8..16]).ok_or(VmciError::Protocol("datagram src"))?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[16..24]);
        let size = u64::from_le_bytes(size);
        if size != (buf.len() - Self::HEADER_SIZE) as u64 {
            return Err(VmciError::Protocol("datagram payload size mismatch"));
        }
        Ok(Self {
            dst,
            src,
            payload: buf[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

/// Datagram receive callback.
pub type DatagramCallback = Arc<dyn Fn(&Datagram) + Send + Sync>;

pub(crate) struct DatagramEntry {
    callback: DatagramCallback,
}

impl Transport {
    /// Register a datagram handler.
    ///
    /// `resource` may be [`INVALID_ID`] to have one allocated. The handler
    /// always lives in this transport's own context.
    pub fn datagram_create(&self, resource: ResourceId, callback: DatagramCallback) -> Result<Handle> {
        let own = self.own_cid();
        if own == INVALID_ID {
            return Err(VmciError::InvalidArgs("context id not yet known"));
        }
        let entry = Arc::new(DatagramEntry { callback });
        let handle = self
            .resources
            .add(ResourceKind::Datagram, Handle::new(own, resource), entry)?;
        tracing::debug!(%handle, "datagram handler created");
        Ok(handle)
    }

    pub fn datagram_destroy(&self, handle: Handle) -> Result<()> {
        self.resources.remove(handle, ResourceKind::Datagram)?;
        tracing::debug!(%handle, "datagram handler destroyed");
        Ok(())
    }

    /// Route and send a datagram from a local client.
    pub fn datagram_send(&self, mut datagram: Datagram) -> Result<usize> {
        self.check_payload(&datagram)?;
        match route(&self.contexts, &mut datagram.src, &datagram.dst, false)? {
            Route::AsGuest => self.platform.send_datagram(&datagram),
            Route::AsHost => self.dispatch_as_host(datagram),
            Route::None => Err(VmciError::Unreachable),
        }
    }

    /// Host: a datagram arriving from guest context `sender`.
    pub fn datagram_dispatch(&self, sender: ContextId, mut datagram: Datagram) -> Result<usize> {
        self.check_payload(&datagram)?;
        if datagram.src.context != sender {
            tracing::warn!(sender, src = %datagram.src, "spoofed datagram source");
            return Err(VmciError::NoAccess);
        }
        match route(&self.contexts, &mut datagram.src, &datagram.dst, true)? {
            Route::AsHost => self.dispatch_as_host(datagram),
            _ => Err(VmciError::Unreachable),
        }
    }

    /// Guest: a datagram the device delivered to one of our handlers.
    pub fn datagram_deliver(&self, datagram: &Datagram) -> Result<usize> {
        let entry: Arc<DatagramEntry> = self
            .resources
            .get(datagram.dst, ResourceKind::Datagram)
            .ok_or(VmciError::NotFound)?;
        (entry.callback)(datagram);
        Ok(datagram.total_size())
    }

    fn dispatch_as_host(&self, datagram: Datagram) -> Result<usize> {
        if datagram.dst.context == HOST_CONTEXT_ID {
            match self.datagram_deliver(&datagram) {
                Err(VmciError::NotFound) => {
                    tracing::debug!(dst = %datagram.dst, "no handler for host datagram");
                    Err(VmciError::Unreachable)
                }
                other => other,
            }
        } else {
            self.platform.send_datagram(&datagram)
        }
    }

    fn check_payload(&self, datagram: &Datagram) -> Result<()> {
        let max = self.config.datagram.max_payload;
        if datagram.payload.len() > max {
            return Err(VmciError::PayloadTooLarge {
                len: datagram.payload.len(),
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmciConfig;
    use crate::loopback::Fabric;
    use std::sync::Mutex;

    #[test]
    fn test_wire_form() {
        let dg = Datagram::new(Handle::new(2, 2000), Handle::new(10, 1500), b"ping".to_vec());
        let bytes = dg.to_bytes();
        assert_eq!(bytes.len(), dg.total_size());
        assert_eq!(Datagram::from_bytes(&bytes).unwrap(), dg);
        assert!(Datagram::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Datagram::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_host_local_delivery() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        let inbox = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&inbox);
        let handle = host
            .datagram_create(
                3000,
                Arc::new(move |dg: &Datagram| sink.lock().unwrap().push(dg.clone())),
            )
            .unwrap();
        assert_eq!(handle, Handle::new(HOST_CONTEXT_ID, 3000));

        let dg = Datagram::new(handle, Handle::new(INVALID_ID, 42), b"hi".to_vec());
        assert_eq!(host.datagram_send(dg).unwrap(), Datagram::HEADER_SIZE + 2);

        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].src, Handle::new(HOST_CONTEXT_ID, 42));
    }

    #[test]
    fn test_guest_to_host_roundtrip() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        let guest = fabric.guest(VmciConfig::default(), 10).unwrap();

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let host_handle = host
            .datagram_create(
                INVALID_ID,
                Arc::new(move |dg: &Datagram| sink.lock().unwrap().push(dg.src)),
            )
            .unwrap();

        let reply_box = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::clone(&reply_box);
        let guest_handle = guest
            .datagram_create(
                INVALID_ID,
                Arc::new(move |dg: &Datagram| replies.lock().unwrap().push(dg.payload.clone())),
            )
            .unwrap();

        guest
            .datagram_send(Datagram::new(host_handle, guest_handle, b"up".to_vec()))
            .unwrap();
        assert_eq!(*inbox.lock().unwrap(), vec![guest_handle]);

        host.datagram_send(Datagram::new(guest_handle, host_handle, b"down".to_vec()))
            .unwrap();
        assert_eq!(*reply_box.lock().unwrap(), vec![b"down".to_vec()]);
    }

    #[test]
    fn test_payload_limit() {
        let fabric = Fabric::new();
        let mut config = VmciConfig::default();
        config.datagram.max_payload = 16;
        let host = fabric.host(config).unwrap();
        let handle = host
            .datagram_create(INVALID_ID, Arc::new(|_: &Datagram| {}))
            .unwrap();

        let dg = Datagram::new(handle, handle, vec![0; 17]);
        assert!(matches!(
            host.datagram_send(dg),
            Err(VmciError::PayloadTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_unknown_host_handler_is_unreachable() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        let dg = Datagram::new(Handle::new(HOST_CONTEXT_ID, 9999), Handle::INVALID, vec![]);
        assert!(matches!(host.datagram_send(dg), Err(VmciError::Unreachable)));
    }

    #[test]
    fn test_spoofed_source_rejected() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        let _guest = fabric.guest(VmciConfig::default(), 10).unwrap();
        let handle = host
            .datagram_create(INVALID_ID, Arc::new(|_: &Datagram| {}))
            .unwrap();
        let dg = Datagram::new(handle, Handle::new(11, 5000), vec![]);
        assert!(matches!(host.datagram_dispatch(10, dg), Err(VmciError::NoAccess)));
    }
}
