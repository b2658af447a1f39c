//! # Ordered Locking Primitives
//!
//! Spin lock wrappers that encode their position in the transport's lock
//! hierarchy. Locks must be acquired in increasing level order:
//!
//! | Level | Lock                                        |
//! |-------|---------------------------------------------|
//! | 0     | resource table                              |
//! | 1     | doorbell index table, handler/event tables  |
//! | 2     | queue pair headers, channel state           |
//!
//! No lock of these levels is ever held while a client callback runs.

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ordering levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: the handle-keyed resource table.
    Registry = 0,
    /// Level 1: per-kind tables (doorbell index, datagram handlers, events).
    Table = 1,
    /// Level 2: individual object state.
    Object = 2,
}

/// A spin read-write lock with an associated ordering level.
pub struct OrderedRwLock<T, const LEVEL: u8> {
    inner: RwLock<T>,
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedRwLock<T, LEVEL> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            inner: RwLock::new(value),
            name,
        }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// A spin mutex with an associated ordering level.
///
/// Safe to take from deferred-work and interrupt-like contexts; hold it only
/// for short, non-blocking critical sections.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            name,
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 lock - the resource table.
pub type RegistryLock<T> = OrderedRwLock<T, { LockLevel::Registry as u8 }>;

/// Level 1 lock - per-kind tables.
pub type TableLock<T> = OrderedRwLock<T, { LockLevel::Table as u8 }>;

/// Level 1 spin mutex - the doorbell index table.
pub type TableMutex<T> = OrderedMutex<T, { LockLevel::Table as u8 }>;

/// Level 2 spin mutex - queue pair headers and channel state.
pub type ObjectMutex<T> = OrderedMutex<T, { LockLevel::Object as u8 }>;
