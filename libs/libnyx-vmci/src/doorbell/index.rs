//! Notification index table
//!
//! Guest doorbells are multiplexed on a byte bitmap shared with the device:
//! each doorbell is linked to one bitmap index, and the device sets that byte
//! to ring it. The table hands out indices and finds entries by index.
//!
//! Index assignment keeps `max_notify_idx` (one past the highest index in
//! use) as small as possible so that the bitmap scan stays short:
//!
//! 1. reuse the last released index if it is below the maximum and free,
//! 2. else, if more than one index below the maximum is free, scan round
//!    robin for one starting at the last reserved index,
//! 3. else grow the maximum by one.
//!
//! The maximum never passes the bitmap size. Once it reaches it, any free
//! index is taken, and once every byte of the bitmap is in use, indices are
//! shared round robin.

use crate::handle::{Handle, INVALID_ID};

struct Slot<T> {
    handle: Handle,
    idx: u32,
    value: T,
}

/// Bucketed map of notification indices to doorbells.
pub struct NotifyIndexTable<T> {
    buckets: Vec<Vec<Slot<T>>>,
    bitmap_size: u32,
    max_notify_idx: u32,
    notify_idx_count: u32,
    last_notify_idx_reserved: u32,
    last_notify_idx_released: u32,
}

impl<T> NotifyIndexTable<T> {
    pub fn new(table_size: u32, bitmap_size: u32) -> Self {
        let mut buckets = Vec::with_capacity(table_size as usize);
        buckets.resize_with(table_size.max(1) as usize, Vec::new);
        Self {
            buckets,
            bitmap_size,
            max_notify_idx: 0,
            notify_idx_count: 0,
            last_notify_idx_reserved: 0,
            last_notify_idx_released: INVALID_ID,
        }
    }

    #[inline]
    fn bucket(&self, idx: u32) -> usize {
        idx as usize % self.buckets.len()
    }

    /// One past the highest index in use.
    pub fn max_notify_idx(&self) -> u32 {
        self.max_notify_idx
    }

    /// Number of linked doorbells.
    pub fn notify_idx_count(&self) -> u32 {
        self.notify_idx_count
    }

    pub fn index_in_use(&self, idx: u32) -> bool {
        self.buckets[self.bucket(idx)].iter().any(|slot| slot.idx == idx)
    }

    /// Link `handle` and return its notification index.
    pub fn add(&mut self, handle: Handle, value: T) -> u32 {
        let new_idx = if self.notify_idx_count < self.bitmap_size {
            self.pick_index()
        } else {
            self.notify_idx_count % self.bitmap_size
        };

        let bucket = self.bucket(new_idx);
        self.buckets[bucket].push(Slot { handle, idx: new_idx, value });
        self.notify_idx_count += 1;
        self.last_notify_idx_reserved = new_idx;
        new_idx
    }

    /// Pick a free index; `max_notify_idx` never grows past the bitmap.
    fn pick_index(&mut self) -> u32 {
        let released = self.last_notify_idx_released;
        if released < self.max_notify_idx && !self.index_in_use(released) {
            self.last_notify_idx_released = INVALID_ID;
            return released;
        }

        let at_limit = self.max_notify_idx >= self.bitmap_size;
        if at_limit || self.notify_idx_count + 1 < self.max_notify_idx {
            if let Some(free) = self.scan_free() {
                return free;
            }
        }
        if at_limit {
            return self.notify_idx_count % self.bitmap_size;
        }

        let grown = self.max_notify_idx;
        self.max_notify_idx += 1;
        grown
    }

    /// Round robin scan below `max_notify_idx` from the last reservation.
    fn scan_free(&self) -> Option<u32> {
        if self.max_notify_idx == 0 {
            return None;
        }
        let mut candidate = self.last_notify_idx_reserved % self.max_notify_idx;
        for _ in 0..self.max_notify_idx {
            if !self.index_in_use(candidate) {
                return Some(candidate);
            }
            candidate = (candidate + 1) % self.max_notify_idx;
        }
        None
    }

    /// Unlink `handle`, returning its index and value.
    pub fn remove(&mut self, handle: Handle) -> Option<(u32, T)> {
        let (bucket, position) = self.buckets.iter().enumerate().find_map(|(b, slots)| {
            slots
                .iter()
                .position(|slot| slot.handle == handle)
                .map(|p| (b, p))
        })?;
        let slot = self.buckets[bucket].swap_remove(position);
        self.notify_idx_count -= 1;

        // Removing the highest index lets the scan range shrink
        if slot.idx + 1 == self.max_notify_idx {
            while self.max_notify_idx > 0 && !self.index_in_use(self.max_notify_idx - 1) {
                self.max_notify_idx -= 1;
            }
        }
        self.last_notify_idx_released = slot.idx;
        Some((slot.idx, slot.value))
    }

    /// Entries linked at `idx`.
    pub fn at(&self, idx: u32) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.buckets[self.bucket(idx)]
            .iter()
            .filter(move |slot| slot.idx == idx)
            .map(|slot| (slot.handle, &slot.value))
    }

    /// Every linked entry with its index.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, u32, &T)> + '_ {
        self.buckets
            .iter()
            .flatten()
            .map(|slot| (slot.handle, slot.idx, &slot.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NotifyIndexTable<()> {
        NotifyIndexTable::new(64, 4096)
    }

    fn h(resource: u32) -> Handle {
        Handle::new(10, resource)
    }

    #[test]
    fn test_grows_sequentially() {
        let mut t = table();
        assert_eq!(t.add(h(1), ()), 0);
        assert_eq!(t.add(h(2), ()), 1);
        assert_eq!(t.add(h(3), ()), 2);
        assert_eq!(t.max_notify_idx(), 3);
        assert_eq!(t.notify_idx_count(), 3);
    }

    #[test]
    fn test_reuses_released_index() {
        let mut t = table();
        for r in 1..=4 {
            t.add(h(r), ());
        }
        assert_eq!(t.remove(h(2)), Some((1, ())));
        assert_eq!(t.add(h(5), ()), 1);
        assert_eq!(t.max_notify_idx(), 4);
    }

    #[test]
    fn test_scans_for_hole() {
        let mut t = table();
        for r in 1..=6 {
            t.add(h(r), ());
        }
        t.remove(h(2));
        t.remove(h(3));
        t.remove(h(4));
        // Index 3 was released last and is reused first
        assert_eq!(t.add(h(7), ()), 3);
        // Index 1 is found by the round robin scan from the last reservation
        assert_eq!(t.add(h(8), ()), 1);
        assert_eq!(t.max_notify_idx(), 6);
        // A single remaining hole is not worth a scan
        assert_eq!(t.add(h(9), ()), 6);
        assert!(!t.index_in_use(2));
    }

    #[test]
    fn test_prunes_max_on_highest_removal() {
        let mut t = table();
        for r in 1..=4 {
            t.add(h(r), ());
        }
        t.remove(h(3));
        assert_eq!(t.max_notify_idx(), 4);
        t.remove(h(4));
        assert_eq!(t.max_notify_idx(), 2);
        t.remove(h(1));
        t.remove(h(2));
        assert_eq!(t.max_notify_idx(), 0);
        assert_eq!(t.notify_idx_count(), 0);
    }

    #[test]
    fn test_full_bitmap_shares_indices() {
        let mut t = NotifyIndexTable::new(4, 4);
        for r in 0..4 {
            assert_eq!(t.add(h(r), ()), r);
        }
        let shared = t.add(h(100), ());
        assert!(shared < 4);
        assert_eq!(t.at(shared).count(), 2);
    }

    #[test]
    fn test_last_hole_below_bitmap_end_is_used() {
        let mut t = NotifyIndexTable::new(4, 4);
        for r in 0..4 {
            t.add(h(r), ());
        }
        t.remove(h(1));
        t.remove(h(2));

        assert_eq!(t.add(h(10), ()), 2);
        // One hole left at the bitmap limit: take it rather than grow
        assert_eq!(t.add(h(11), ()), 1);
        assert_eq!(t.max_notify_idx(), 4);
        assert_eq!(t.notify_idx_count(), 4);

        // Now full: share
        assert!(t.add(h(12), ()) < 4);
        assert_eq!(t.max_notify_idx(), 4);
    }

    #[test]
    fn test_lookup_by_index() {
        let mut t = NotifyIndexTable::new(2, 4096);
        let a = t.add(h(1), "a");
        let b = t.add(h(2), "b");
        let c = t.add(h(3), "c");
        // a and c share a bucket but not an index
        assert_eq!(t.at(a).map(|(_, v)| *v).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(t.at(c).map(|(_, v)| *v).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(t.at(b).next().map(|(handle, _)| handle), Some(h(2)));
        assert_eq!(t.iter().count(), 3);
        assert!(t.remove(h(99)).is_none());
    }
}
