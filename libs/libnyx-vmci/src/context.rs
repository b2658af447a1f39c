//! Context registry: who we are and which personalities are active
//!
//! Routing only ever reads this state. It is written when a device comes up
//! or goes away and when the host personality learns about a VM.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use hashbrown::HashSet;

use crate::handle::{context_is_vm, ContextId, INVALID_ID};
use crate::sync::TableLock;

bitflags::bitflags! {
    /// Active driver personalities.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Personality: u8 {
        /// A guest device is present: we can talk down to the host.
        const GUEST = 1 << 0;
        /// A host device is present: we serve VM contexts.
        const HOST = 1 << 1;
    }
}

/// Process-wide context state for one transport instance.
pub struct ContextRegistry {
    own_cid: AtomicU32,
    personality: AtomicU8,
    contexts: TableLock<HashSet<ContextId>>,
}

impl ContextRegistry {
    pub fn new(own_cid: ContextId, personality: Personality) -> Self {
        Self {
            own_cid: AtomicU32::new(own_cid),
            personality: AtomicU8::new(personality.bits()),
            contexts: TableLock::new(HashSet::new(), "vm_contexts"),
        }
    }

    /// The context id of this endpoint.
    pub fn own_cid(&self) -> ContextId {
        self.own_cid.load(Ordering::Acquire)
    }

    /// Update the context id (the guest learns it from the device).
    pub fn set_own_cid(&self, cid: ContextId) {
        self.own_cid.store(cid, Ordering::Release);
    }

    pub fn personality(&self) -> Personality {
        Personality::from_bits_truncate(self.personality.load(Ordering::Acquire))
    }

    pub fn guest_active(&self) -> bool {
        self.personality().contains(Personality::GUEST)
    }

    pub fn host_active(&self) -> bool {
        self.personality().contains(Personality::HOST)
    }

    /// Activate a personality (device probe).
    pub fn activate(&self, personality: Personality) {
        self.personality.fetch_or(personality.bits(), Ordering::AcqRel);
        tracing::debug!(?personality, "personality activated");
    }

    /// Deactivate a personality (device removal).
    pub fn deactivate(&self, personality: Personality) {
        self.personality.fetch_and(!personality.bits(), Ordering::AcqRel);
        tracing::debug!(?personality, "personality deactivated");
    }

    /// Register a VM context served by the host personality.
    ///
    /// Returns false if the id is not a VM context or is already known.
    pub fn add_context(&self, cid: ContextId) -> bool {
        if !context_is_vm(cid) {
            return false;
        }
        self.contexts.write().insert(cid)
    }

    /// Forget a VM context.
    pub fn remove_context(&self, cid: ContextId) -> bool {
        self.contexts.write().remove(&cid)
    }

    /// Whether a VM context is currently registered.
    pub fn context_exists(&self, cid: ContextId) -> bool {
        cid != INVALID_ID && self.contexts.read().contains(&cid)
    }
}
