//! Doorbells
//!
//! A doorbell is a notification handle with a callback. Ringing it runs the
//! callback in the owner's context, either synchronously ("run now") or on
//! the transport worker ("run later", `DELAYED_CB`).
//!
//! Host doorbells are found through the resource table. Guest doorbells are
//! additionally linked to a notification bitmap index so the device can ring
//! many of them with a single interrupt; the host asks the device to do so
//! with a datagram to the VM's doorbell-notify resource.
//!
//! Callbacks never run with the index table locked. Each entry carries an
//! in-flight tracker; `doorbell_destroy` unlinks the entry first and then
//! waits for running and queued callbacks, so a doorbell must not be
//! destroyed from its own callback.

mod bitmap;
mod index;

pub use bitmap::NotificationBitmap;
pub use index::NotifyIndexTable;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::datagram::Datagram;
use crate::error::{Result, VmciError};
use crate::handle::{resource, Handle, PrivilegeFlags, HOST_CONTEXT_ID, INVALID_ID};
use crate::resource::{InFlight, InFlightGuard, ResourceKind};
use crate::route::{route, Route};
use crate::transport::Transport;

bitflags::bitflags! {
    /// Doorbell creation flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DoorbellFlags: u32 {
        /// Run the callback on the worker instead of the notifying thread.
        const DELAYED_CB = 1 << 0;
    }
}

/// Doorbell callback.
pub type DoorbellCallback = Arc<dyn Fn() + Send + Sync>;

pub struct DoorbellEntry {
    priv_flags: PrivilegeFlags,
    run_delayed: bool,
    callback: DoorbellCallback,
    active: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl DoorbellEntry {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// True if privileges forbid `src` from talking to `dst`.
pub fn deny_interaction(src: PrivilegeFlags, dst: PrivilegeFlags) -> bool {
    (src.contains(PrivilegeFlags::RESTRICTED) && !dst.contains(PrivilegeFlags::TRUSTED))
        || (dst.contains(PrivilegeFlags::RESTRICTED) && !src.contains(PrivilegeFlags::TRUSTED))
}

impl Transport {
    /// Create a doorbell.
    ///
    /// An invalid `handle` allocates a resource id in our own context. An
    /// explicit handle must name the host context, or our own context when
    /// the guest personality is active, and a valid resource.
    pub fn doorbell_create(
        &self,
        handle: Handle,
        flags: DoorbellFlags,
        priv_flags: PrivilegeFlags,
        callback: DoorbellCallback,
    ) -> Result<Handle> {
        let own = self.own_cid();
        let requested = if handle.is_invalid() {
            if own == INVALID_ID {
                return Err(VmciError::InvalidArgs("context id not yet known"));
            }
            Handle::new(own, INVALID_ID)
        } else {
            let valid_context = handle.context == HOST_CONTEXT_ID
                || (self.contexts.guest_active() && handle.context == own);
            if !valid_context || handle.resource == INVALID_ID {
                return Err(VmciError::InvalidArgs("doorbell handle outside our context"));
            }
            handle
        };

        let entry = Arc::new(DoorbellEntry {
            priv_flags,
            run_delayed: flags.contains(DoorbellFlags::DELAYED_CB),
            callback,
            active: AtomicBool::new(false),
            in_flight: InFlight::new(),
        });

        let handle = self
            .resources
            .add(ResourceKind::Doorbell, requested, Arc::clone(&entry))?;

        if self.contexts.guest_active() {
            let idx = self.doorbells.lock().add(handle, Arc::clone(&entry));
            if let Err(err) = self.platform.link(handle, idx) {
                tracing::warn!(%handle, idx, %err, "failed to link doorbell");
                self.doorbells.lock().remove(handle);
                if let Err(remove_err) = self.resources.remove(handle, ResourceKind::Doorbell) {
                    tracing::debug!(%handle, %remove_err, "doorbell already unregistered");
                }
                return Err(err);
            }
            entry.active.store(true, Ordering::Release);
            tracing::debug!(%handle, idx, "doorbell linked");
        } else {
            entry.active.store(true, Ordering::Release);
        }

        tracing::debug!(%handle, delayed = entry.run_delayed, "doorbell created");
        Ok(handle)
    }

    /// Destroy a doorbell and wait for its in-flight callbacks.
    pub fn doorbell_destroy(&self, handle: Handle) -> Result<()> {
        let entry: Arc<DoorbellEntry> = self
            .resources
            .get(handle, ResourceKind::Doorbell)
            .ok_or(VmciError::NotFound)?;
        entry.active.store(false, Ordering::Release);

        let linked = self.doorbells.lock().remove(handle);
        if let Some((idx, _)) = linked {
            // Fails legitimately once the device has forgotten the link,
            // e.g. after hibernation.
            if let Err(err) = self.platform.unlink(handle) {
                tracing::debug!(%handle, idx, %err, "failed to unlink doorbell");
            }
        }

        self.resources.remove(handle, ResourceKind::Doorbell)?;
        if self.work.is_worker_thread() {
            // A delayed callback tearing the transport down cannot wait for itself
            tracing::debug!(%handle, in_flight = entry.in_flight.count(), "doorbell destroyed from the worker");
        } else {
            entry.in_flight.wait_idle();
        }
        tracing::debug!(%handle, "doorbell destroyed");
        Ok(())
    }

    /// Ring a doorbell from a local client.
    pub fn doorbell_notify(&self, dst: Handle, priv_flags: PrivilegeFlags) -> Result<()> {
        if dst.is_invalid() {
            return Err(VmciError::InvalidArgs("invalid doorbell handle"));
        }

        let mut src = Handle::INVALID;
        match route(&self.contexts, &mut src, &dst, false)? {
            Route::AsHost if dst.context == HOST_CONTEXT_ID => self.host_notify(dst, priv_flags),
            Route::AsHost => {
                self.platform.send_datagram(&notify_datagram(dst))?;
                Ok(())
            }
            Route::AsGuest => self.platform.notify(dst, priv_flags),
            Route::None => Err(VmciError::Unreachable),
        }
    }

    /// Host: ring one of our doorbells on behalf of `src_priv_flags`.
    pub fn host_notify(&self, handle: Handle, src_priv_flags: PrivilegeFlags) -> Result<()> {
        if handle.context != HOST_CONTEXT_ID {
            return Err(VmciError::InvalidArgs("not a host doorbell"));
        }
        let (entry, guard) = self
            .resources
            .with(handle, ResourceKind::Doorbell, |entry: &Arc<DoorbellEntry>| {
                (Arc::clone(entry), entry.in_flight.enter())
            })
            .ok_or(VmciError::NotFound)?;
        if deny_interaction(src_priv_flags, entry.priv_flags) {
            return Err(VmciError::NoAccess);
        }
        if !entry.is_active() {
            return Err(VmciError::NotFound);
        }
        self.fire(handle, entry, guard);
        Ok(())
    }

    /// Privilege flags a doorbell was created with.
    pub fn doorbell_priv_flags(&self, handle: Handle) -> Result<PrivilegeFlags> {
        if handle.is_invalid() {
            return Err(VmciError::InvalidArgs("invalid doorbell handle"));
        }
        self.resources
            .get::<DoorbellEntry>(handle, ResourceKind::Doorbell)
            .map(|entry| entry.priv_flags)
            .ok_or(VmciError::NotFound)
    }

    /// Fire every active doorbell whose bitmap byte is pending.
    pub fn scan_notification_bitmap(&self) {
        let Some(bitmap) = self.bitmap.as_ref() else {
            return;
        };
        let max = self.doorbells.lock().max_notify_idx().min(bitmap.len());
        for idx in 0..max {
            if bitmap.test_and_clear(idx) {
                self.fire_index(idx);
            }
        }
    }

    /// Fire the active doorbells linked at `idx`.
    ///
    /// Each entry is looked up again and claimed under the table lock right
    /// before it fires, so a doorbell destroyed by an earlier callback on the
    /// same index is skipped.
    pub fn fire_index(&self, idx: u32) {
        let handles: Vec<Handle> = self.doorbells.lock().at(idx).map(|(handle, _)| handle).collect();

        for handle in handles {
            let claimed = self
                .doorbells
                .lock()
                .at(idx)
                .find(|(linked, entry)| *linked == handle && entry.is_active())
                .map(|(_, entry)| (Arc::clone(entry), entry.in_flight.enter()));
            if let Some((entry, guard)) = claimed {
                self.fire(handle, entry, guard);
            }
        }
    }

    /// Hibernation: deactivate on entry, relink on resume.
    pub fn doorbell_hibernate(&self, enter: bool) {
        let linked: Vec<(Handle, u32, Arc<DoorbellEntry>)> = self
            .doorbells
            .lock()
            .iter()
            .map(|(handle, idx, entry)| (handle, idx, Arc::clone(entry)))
            .collect();

        for (handle, idx, entry) in linked {
            if enter {
                entry.active.store(false, Ordering::Release);
                continue;
            }
            match self.platform.link(handle, idx) {
                Ok(()) | Err(VmciError::DuplicateEntry) => {
                    entry.active.store(true, Ordering::Release);
                }
                Err(err) => {
                    tracing::warn!(%handle, idx, %err, "failed to relink doorbell");
                }
            }
        }
        tracing::debug!(enter, "doorbell hibernation transition");
    }

    /// Highest notification index in use plus one.
    pub fn max_notify_idx(&self) -> u32 {
        self.doorbells.lock().max_notify_idx()
    }

    pub fn notify_idx_count(&self) -> u32 {
        self.doorbells.lock().notify_idx_count()
    }

    /// Notification index a guest doorbell is linked at.
    pub fn doorbell_index(&self, handle: Handle) -> Option<u32> {
        self.doorbells
            .lock()
            .iter()
            .find(|(linked, _, _)| *linked == handle)
            .map(|(_, idx, _)| idx)
    }

    fn fire(&self, handle: Handle, entry: Arc<DoorbellEntry>, guard: InFlightGuard) {
        if entry.run_delayed {
            let scheduled = self.work.schedule(move || {
                if entry.is_active() {
                    (entry.callback)();
                }
                drop(guard);
            });
            if !scheduled {
                tracing::debug!(%handle, "failed to schedule delayed doorbell callback");
            }
        } else {
            (entry.callback)();
            drop(guard);
        }
    }
}

/// Control datagram asking the device to ring a VM doorbell.
fn notify_datagram(dst: Handle) -> Datagram {
    Datagram::new(
        Handle::new(dst.context, resource::DOORBELL_NOTIFY),
        Handle::new(HOST_CONTEXT_ID, resource::DOORBELL_NOTIFY),
        dst.to_le_bytes().to_vec(),
    )
}
