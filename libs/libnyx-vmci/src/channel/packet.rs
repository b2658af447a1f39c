//! Page channel wire format
//!
//! ```text
//! +----------+-------------+-----------+-----------------+--------------------+
//! | type u32 | msg_len u32 | elems u32 | message[msg_len] | elem[elems] (16 B) |
//! +----------+-------------+-----------+-----------------+--------------------+
//! ```
//!
//! All fields are little endian. The type is validated before anything else
//! in the header is trusted.

use crate::error::{Result, VmciError};
use crate::handle::Handle;

/// Packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Host acknowledges a connection, carries its doorbell.
    HyperConnect = 0,
    /// Guest requests a connection over its queue pair.
    GuestConnect = 1,
    /// Guest acknowledges a disconnect.
    GuestDisconnect = 2,
    /// Host tears the connection down.
    HyperDisconnect = 3,
    /// Payload filling receive buffers.
    Data = 4,
    /// Receive buffers made available to the peer.
    SetRecvBuffer = 5,
    /// Ask the peer for more receive buffers.
    RequestBuffer = 6,
    /// Client-defined completion.
    CompletionNotify = 7,
}

impl PacketType {
    /// Types a client may put on the queue pair; the rest belong to the
    /// channel's own handshake and buffer accounting.
    pub fn is_client_payload(self) -> bool {
        matches!(self, Self::Data | Self::RequestBuffer | Self::CompletionNotify)
    }
}

impl TryFrom<u32> for PacketType {
    type Error = VmciError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::HyperConnect,
            1 => Self::GuestConnect,
            2 => Self::GuestDisconnect,
            3 => Self::HyperDisconnect,
            4 => Self::Data,
            5 => Self::SetRecvBuffer,
            6 => Self::RequestBuffer,
            7 => Self::CompletionNotify,
            _ => return Err(VmciError::Protocol("unknown packet type")),
        })
    }
}

/// Scatter/gather element: one buffer owned by a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgElem {
    pub addr: u64,
    pub len: u32,
    pub flags: u32,
}

impl SgElem {
    pub const WIRE_SIZE: usize = 16;

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            addr: read_u64(&buf[0..8]),
            len: read_u32(&buf[8..12]),
            flags: read_u32(&buf[12..16]),
        }
    }
}

/// Fixed packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketType,
    pub message_len: u32,
    pub num_elems: u32,
}

impl PacketHeader {
    pub const SIZE: usize = 12;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(VmciError::Protocol("short packet header"));
        }
        let kind = PacketType::try_from(read_u32(&buf[0..4]))?;
        Ok(Self {
            kind,
            message_len: read_u32(&buf[4..8]),
            num_elems: read_u32(&buf[8..12]),
        })
    }

    /// Header, message and elements.
    pub fn total_size(&self) -> u64 {
        Self::SIZE as u64
            + u64::from(self.message_len)
            + u64::from(self.num_elems) * SgElem::WIRE_SIZE as u64
    }
}

/// A decoded packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub message: Vec<u8>,
    pub elems: Vec<SgElem>,
}

impl Packet {
    pub fn new(kind: PacketType, message: Vec<u8>, elems: Vec<SgElem>) -> Self {
        Self { kind, message, elems }
    }

    pub fn control(kind: PacketType) -> Self {
        Self::new(kind, Vec::new(), Vec::new())
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            kind: self.kind,
            message_len: self.message.len() as u32,
            num_elems: self.elems.len() as u32,
        }
    }

    pub fn encoded_len(&self) -> usize {
        PacketHeader::SIZE + self.message.len() + self.elems.len() * SgElem::WIRE_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&(self.message.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.elems.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.message);
        for elem in &self.elems {
            elem.write(&mut out);
        }
        out
    }

    /// Decode exactly one packet occupying all of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = PacketHeader::parse(buf)?;
        if header.total_size() != buf.len() as u64 {
            return Err(VmciError::Protocol("packet length mismatch"));
        }

        let message_end = PacketHeader::SIZE + header.message_len as usize;
        let message = buf[PacketHeader::SIZE..message_end].to_vec();
        let elems = buf[message_end..]
            .chunks_exact(SgElem::WIRE_SIZE)
            .map(SgElem::read)
            .collect();

        Ok(Self {
            kind: header.kind,
            message,
            elems,
        })
    }
}

/// `GuestConnect` message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestConnectMessage {
    pub dgram_handle: Handle,
    pub qp_handle: Handle,
    pub produce_size: u64,
    pub consume_size: u64,
    pub doorbell_handle: Handle,
}

impl GuestConnectMessage {
    pub const SIZE: usize = 3 * Handle::WIRE_SIZE + 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.dgram_handle.to_le_bytes());
        out.extend_from_slice(&self.qp_handle.to_le_bytes());
        out.extend_from_slice(&self.produce_size.to_le_bytes());
        out.extend_from_slice(&self.consume_size.to_le_bytes());
        out.extend_from_slice(&self.doorbell_handle.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::SIZE {
            return Err(VmciError::Protocol("bad connect message size"));
        }
        let handle_at = |offset: usize| {
            Handle::from_le_bytes(&buf[offset..offset + Handle::WIRE_SIZE])
                .ok_or(VmciError::Protocol("bad handle in connect message"))
        };
        Ok(Self {
            dgram_handle: handle_at(0)?,
            qp_handle: handle_at(8)?,
            produce_size: read_u64(&buf[16..24]),
            consume_size: read_u64(&buf[24..32]),
            doorbell_handle: handle_at(32)?,
        })
    }
}

/// `HyperConnect` message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HyperConnectMessage {
    pub doorbell_handle: Handle,
}

impl HyperConnectMessage {
    pub const SIZE: usize = Handle::WIRE_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        self.doorbell_handle.to_le_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::SIZE {
            return Err(VmciError::Protocol("bad connect reply size"));
        }
        let doorbell_handle =
            Handle::from_le_bytes(buf).ok_or(VmciError::Protocol("bad handle in connect reply"))?;
        Ok(Self { doorbell_handle })
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_payload_types() {
        assert!(PacketType::Data.is_client_payload());
        assert!(PacketType::RequestBuffer.is_client_payload());
        assert!(PacketType::CompletionNotify.is_client_payload());
        assert!(!PacketType::GuestConnect.is_client_payload());
        assert!(!PacketType::SetRecvBuffer.is_client_payload());
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(
            PacketType::Data,
            vec![0xaa, 0xbb],
            vec![SgElem { addr: 0x1000, len: 512, flags: 0 }],
        );
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 12 + 2 + 16);
        assert_eq!(&bytes[0..4], &4u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(&bytes[14..22], &0x1000u64.to_le_bytes());
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_unknown_type_rejected_first() {
        let mut bytes = Packet::control(PacketType::RequestBuffer).encode();
        bytes[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            PacketHeader::parse(&bytes),
            Err(VmciError::Protocol("unknown packet type"))
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = Packet::control(PacketType::Data).encode();
        bytes[8..12].copy_from_slice(&3u32.to_le_bytes());
        assert!(Packet::decode(&bytes).is_err());
        assert!(PacketHeader::parse(&bytes[..8]).is_err());
    }

    #[test]
    fn test_connect_messages() {
        let msg = GuestConnectMessage {
            dgram_handle: Handle::new(10, 1024),
            qp_handle: Handle::new(10, 1025),
            produce_size: 4096,
            consume_size: 8192,
            doorbell_handle: Handle::new(10, 1026),
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 40);
        assert_eq!(GuestConnectMessage::decode(&bytes).unwrap(), msg);
        assert!(GuestConnectMessage::decode(&bytes[..39]).is_err());

        let reply = HyperConnectMessage { doorbell_handle: Handle::new(2, 1027) };
        assert_eq!(HyperConnectMessage::decode(&reply.encode()).unwrap(), reply);
    }
}
