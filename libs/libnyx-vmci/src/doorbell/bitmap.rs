//! Notification bitmap shared with the device
//!
//! One byte per notification index; only the low bit is significant. The
//! device sets it, the guest clears it before firing the linked doorbells.

use core::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0x1;

pub struct NotificationBitmap {
    bytes: Box<[AtomicU8]>,
}

impl NotificationBitmap {
    pub fn new(size: u32) -> Self {
        let bytes = (0..size).map(|_| AtomicU8::new(0)).collect();
        Self { bytes }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Mark `idx` pending; out-of-range indices are ignored.
    pub fn set(&self, idx: u32) {
        if let Some(byte) = self.bytes.get(idx as usize) {
            byte.fetch_or(PENDING, Ordering::Release);
        }
    }

    pub fn is_set(&self, idx: u32) -> bool {
        self.bytes
            .get(idx as usize)
            .is_some_and(|byte| byte.load(Ordering::Acquire) & PENDING != 0)
    }

    /// Clear `idx`, returning whether it was pending.
    pub fn test_and_clear(&self, idx: u32) -> bool {
        self.bytes
            .get(idx as usize)
            .is_some_and(|byte| byte.fetch_and(!PENDING, Ordering::AcqRel) & PENDING != 0)
    }
}
