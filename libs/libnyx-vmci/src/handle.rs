//! Handles: two-part identifiers naming every VMCI endpoint

use core::fmt;

/// Context identifier (one VM, the host, or the hypervisor).
pub type ContextId = u32;

/// Resource identifier within a context.
pub type ResourceId = u32;

/// Invalid context or resource id.
pub const INVALID_ID: u32 = u32::MAX;

/// The hypervisor pseudo-context.
pub const HYPERVISOR_CONTEXT_ID: ContextId = 0;

/// The host context.
pub const HOST_CONTEXT_ID: ContextId = 2;

/// Resource ids at or below this value are never handed out by allocation.
pub const RESERVED_RESOURCE_ID_MAX: ResourceId = 1023;

/// Well-known resources present in every VM context.
pub mod resource {
    use super::ResourceId;

    /// Device endpoint the host uses to ring a VM doorbell.
    pub const DOORBELL_NOTIFY: ResourceId = 15;
}

/// Returns true for contexts that name a virtual machine.
#[inline]
pub fn context_is_vm(context: ContextId) -> bool {
    context != INVALID_ID && context > HOST_CONTEXT_ID
}

/// A (context, resource) pair.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub context: ContextId,
    pub resource: ResourceId,
}

impl Handle {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 8;

    /// The anonymous/invalid handle.
    pub const INVALID: Handle = Handle {
        context: INVALID_ID,
        resource: INVALID_ID,
    };

    pub const fn new(context: ContextId, resource: ResourceId) -> Self {
        Self { context, resource }
    }

    /// A handle is invalid when its context is invalid.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.context == INVALID_ID
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }

    pub fn to_le_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..4].copy_from_slice(&self.context.to_le_bytes());
        out[4..].copy_from_slice(&self.resource.to_le_bytes());
        out
    }

    /// Decode from the first [`Handle::WIRE_SIZE`] bytes of `buf`.
    pub fn from_le_bytes(buf: &[u8]) -> Option<Self> {
        let context = u32::from_le_bytes(buf.get(..4)?.try_into().ok()?);
        let resource = u32::from_le_bytes(buf.get(4..8)?.try_into().ok()?);
        Some(Self { context, resource })
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:0x{:x}", self.context, self.resource)
    }
}

bitflags::bitflags! {
    /// Privileges attached to doorbells and datagram handlers.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PrivilegeFlags: u32 {
        /// Only trusted endpoints may talk to this one.
        const RESTRICTED = 1 << 0;
        /// Endpoint belongs to a trusted component.
        const TRUSTED = 1 << 1;
    }
}
