//! Resource table
//!
//! Every addressable object (datagram handler, doorbell, queue pair) is
//! registered here under its handle. The table is shared across resource
//! kinds so that a handle names at most one object per context.
//!
//! Objects are reference counted with `Arc`. Objects whose callbacks may be
//! running while they are torn down additionally carry an [`InFlight`]
//! tracker: destruction unlinks the object first, then waits for the tracker
//! to drain, then drops the last strong reference.

use core::any::Any;
use hashbrown::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{Result, VmciError};
use crate::handle::{Handle, ResourceId, INVALID_ID, RESERVED_RESOURCE_ID_MAX};
use crate::sync::RegistryLock;

/// Kinds of registered resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Datagram,
    Doorbell,
    QueuePairGuest,
    QueuePairHost,
}

struct Registered {
    kind: ResourceKind,
    object: Arc<dyn Any + Send + Sync>,
}

struct Inner {
    entries: HashMap<Handle, Registered>,
    next_id: ResourceId,
}

/// Handle-keyed registry of live resources.
pub struct ResourceTable {
    inner: RegistryLock<Inner>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            inner: RegistryLock::new(
                Inner {
                    entries: HashMap::new(),
                    next_id: RESERVED_RESOURCE_ID_MAX + 1,
                },
                "resources",
            ),
        }
    }

    /// Register `object` under `handle`.
    ///
    /// If `handle.resource` is invalid a free resource id is allocated in
    /// `handle.context`. Returns the final handle.
    pub fn add<T: Any + Send + Sync>(
        &self,
        kind: ResourceKind,
        handle: Handle,
        object: Arc<T>,
    ) -> Result<Handle> {
        if handle.is_invalid() {
            return Err(VmciError::InvalidArgs("resource handle without context"));
        }

        let mut inner = self.inner.write();
        let handle = if handle.resource == INVALID_ID {
            let id = Self::find_free_id(&mut inner, handle.context)
                .ok_or(VmciError::NoMem("resource id space exhausted"))?;
            Handle::new(handle.context, id)
        } else {
            if inner.entries.contains_key(&handle) {
                return Err(VmciError::DuplicateEntry);
            }
            handle
        };

        inner.entries.insert(handle, Registered { kind, object });
        tracing::trace!(%handle, ?kind, "resource added");
        Ok(handle)
    }

    /// Walk the id space from the rotating cursor until an unused id shows up.
    fn find_free_id(inner: &mut Inner, context: u32) -> Option<ResourceId> {
        let start = inner.next_id;
        loop {
            let candidate = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if inner.next_id == INVALID_ID {
                inner.next_id = RESERVED_RESOURCE_ID_MAX + 1;
            }
            if !inner.entries.contains_key(&Handle::new(context, candidate)) {
                return Some(candidate);
            }
            if inner.next_id == start {
                return None;
            }
        }
    }

    /// Look up a resource of a given kind.
    pub fn get<T: Any + Send + Sync>(&self, handle: Handle, kind: ResourceKind) -> Option<Arc<T>> {
        let object = {
            let inner = self.inner.read();
            let entry = inner.entries.get(&handle)?;
            if entry.kind != kind {
                return None;
            }
            entry.object.clone()
        };
        object.downcast::<T>().ok()
    }

    /// Run `f` on a resource while the table still holds it.
    ///
    /// Anything `f` claims (an in-flight reference, say) is claimed before a
    /// concurrent `remove` can return.
    pub fn with<T, R, F>(&self, handle: Handle, kind: ResourceKind, f: F) -> Option<R>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Arc<T>) -> R,
    {
        let inner = self.inner.read();
        let entry = inner.entries.get(&handle)?;
        if entry.kind != kind {
            return None;
        }
        let object = Arc::clone(&entry.object).downcast::<T>().ok()?;
        Some(f(&object))
    }

    /// Unlink a resource; no new lookup can find it afterwards.
    pub fn remove(&self, handle: Handle, kind: ResourceKind) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.entries.get(&handle) {
            Some(entry) if entry.kind == kind => {
                inner.entries.remove(&handle);
                tracing::trace!(%handle, ?kind, "resource removed");
                Ok(())
            }
            _ => Err(VmciError::NotFound),
        }
    }

    pub fn contains(&self, handle: Handle, kind: ResourceKind) -> bool {
        self.inner
            .read()
            .entries
            .get(&handle)
            .is_some_and(|entry| entry.kind == kind)
    }

    /// Handles of every live resource of a kind.
    pub fn handles(&self, kind: ResourceKind) -> Vec<Handle> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Count of callbacks currently running (or queued) against an object.
///
/// Acts as the destroy-completion signal: `wait_idle` returns once every
/// [`InFlightGuard`] handed out by `enter` has been dropped.
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    /// Take a reference for the duration of one callback.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no callback holds a reference.
    pub fn wait_idle(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _idle = self
            .idle
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Reference held by one in-flight callback.
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self
            .tracker
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.tracker.idle.notify_all();
        }
    }
}
