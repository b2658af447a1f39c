//! Transport instance
//!
//! A [`Transport`] is one loaded driver personality: it owns the context
//! registry, the resource table, the doorbell index table, the event bus and
//! the deferred work queue, and talks to the device through a [`Platform`].
//!
//! `init` brings the registries up; `exit` tears every remaining resource
//! down in dependency order (queue pairs, then doorbells, then datagram
//! handlers) and stops the worker.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::VmciConfig;
use crate::context::{ContextRegistry, Personality};
use crate::doorbell::{DoorbellEntry, NotificationBitmap, NotifyIndexTable};
use crate::error::{Result, VmciError};
use crate::event::{Event, EventBus, EventKind};
use crate::handle::{ContextId, Handle};
use crate::platform::Platform;
use crate::qpair::QueuePair;
use crate::resource::{ResourceKind, ResourceTable};
use crate::sync::TableMutex;
use crate::workqueue::WorkQueue;

/// One guest and/or host personality.
pub struct Transport {
    pub(crate) config: VmciConfig,
    pub(crate) contexts: ContextRegistry,
    pub(crate) resources: ResourceTable,
    pub(crate) doorbells: TableMutex<NotifyIndexTable<Arc<DoorbellEntry>>>,
    pub(crate) bitmap: Option<Arc<NotificationBitmap>>,
    pub(crate) events: EventBus,
    pub(crate) work: WorkQueue,
    pub(crate) platform: Arc<dyn Platform>,
    running: AtomicBool,
}

impl Transport {
    /// Bring up a transport for context `own_cid`.
    ///
    /// With the guest personality a notification bitmap is allocated and
    /// registered with the device.
    pub fn init(
        config: VmciConfig,
        own_cid: ContextId,
        personality: Personality,
        platform: Arc<dyn Platform>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if personality.is_empty() {
            return Err(VmciError::DeviceNotFound);
        }

        let bitmap = if personality.contains(Personality::GUEST) {
            let bitmap = Arc::new(NotificationBitmap::new(config.doorbell.bitmap_size));
            platform.register_bitmap(Arc::clone(&bitmap))?;
            Some(bitmap)
        } else {
            None
        };

        let work = WorkQueue::start(&config.worker.thread_name)?;
        let doorbells = NotifyIndexTable::new(config.doorbell.table_size, config.doorbell.bitmap_size);

        tracing::info!(cid = own_cid, ?personality, "transport initialized");

        Ok(Arc::new(Self {
            contexts: ContextRegistry::new(own_cid, personality),
            resources: ResourceTable::new(),
            doorbells: TableMutex::new(doorbells, "doorbell_index"),
            bitmap,
            events: EventBus::new(),
            work,
            platform,
            running: AtomicBool::new(true),
            config,
        }))
    }

    /// Tear down every remaining resource and stop the worker.
    ///
    /// Idempotent. Must not be called from a transport callback.
    pub fn exit(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for kind in [ResourceKind::QueuePairGuest, ResourceKind::QueuePairHost] {
            for handle in self.resources.handles(kind) {
                if let Some(pair) = self.resources.get::<QueuePair>(handle, kind) {
                    if let Err(err) = pair.release(self) {
                        tracing::warn!(%handle, %err, "queue pair detach failed during exit");
                    }
                }
            }
        }

        for handle in self.resources.handles(ResourceKind::Doorbell) {
            if let Err(err) = self.doorbell_destroy(handle) {
                tracing::warn!(%handle, %err, "doorbell destroy failed during exit");
            }
        }

        for handle in self.resources.handles(ResourceKind::Datagram) {
            if let Err(err) = self.datagram_destroy(handle) {
                tracing::warn!(%handle, %err, "datagram handler destroy failed during exit");
            }
        }

        self.work.shutdown();
        self.contexts
            .deactivate(Personality::GUEST | Personality::HOST);
        tracing::info!(cid = self.own_cid(), "transport exited");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &VmciConfig {
        &self.config
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn own_cid(&self) -> ContextId {
        self.contexts.own_cid()
    }

    /// Guest interrupt: the device flagged pending doorbells.
    pub fn handle_interrupt(&self) {
        self.scan_notification_bitmap();
    }

    /// Host: a VM context came up.
    pub fn context_added(&self, cid: ContextId) -> bool {
        let added = self.contexts.add_context(cid);
        if added {
            tracing::debug!(cid, "context added");
        }
        added
    }

    /// Host: a VM context went away.
    pub fn context_removed(&self, cid: ContextId) {
        if self.contexts.remove_context(cid) {
            tracing::debug!(cid, "context removed");
            self.events.publish(Event {
                kind: EventKind::ContextRemoved,
                handle: Handle::INVALID,
                context: cid,
            });
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HOST_CONTEXT_ID, INVALID_ID};
    use crate::loopback::Fabric;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_requires_a_personality() {
        let fabric = Fabric::new();
        let err = fabric
            .attach(VmciConfig::default(), HOST_CONTEXT_ID, Personality::empty())
            .err()
            .unwrap();
        assert!(matches!(err, VmciError::DeviceNotFound));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let fabric = Fabric::new();
        let mut config = VmciConfig::default();
        config.doorbell.table_size = 0;
        assert!(fabric.attach(config, HOST_CONTEXT_ID, Personality::HOST).is_err());
    }

    #[test]
    fn test_exit_releases_resources() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        host.doorbell_create(Handle::INVALID, Default::default(), Default::default(), Arc::new(|| {}))
            .unwrap();
        host.datagram_create(INVALID_ID, Arc::new(|_: &crate::datagram::Datagram| {}))
            .unwrap();
        assert_eq!(host.resources().len(), 2);

        host.exit();
        assert!(host.resources().is_empty());
        assert!(!host.is_running());
        assert!(!host.contexts().host_active());
        host.exit();
    }

    #[test]
    fn test_context_removed_event() {
        let fabric = Fabric::new();
        let host = fabric.host(VmciConfig::default()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        host.events().subscribe(
            EventKind::ContextRemoved,
            Arc::new(move |event: &Event| {
                assert_eq!(event.context, 12);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(host.context_added(12));
        assert!(!host.context_added(12));
        host.context_removed(12);
        host.context_removed(12);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
