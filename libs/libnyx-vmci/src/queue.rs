//! Queue pair ring buffers
//!
//! A queue pair is two single-producer/single-consumer byte rings, one per
//! direction. Each ring lives in a [`QueueRegion`]: a [`QueueHeader`]
//! followed by `size` bytes of ring memory.
//!
//! ## Split headers
//!
//! Each endpoint only ever *writes* the header of its own produce queue:
//!
//! - `producer_tail` is where it will write next in its produce queue,
//! - `consumer_head` is where it will read next in its consume queue (the
//!   peer's produce queue).
//!
//! Computing free space therefore needs both headers: the tail comes from the
//! produce queue header, the head from the consume queue header (which the
//! peer writes). One byte is always left unused so that `tail == head` means
//! empty; capacity is `size - 1`.
//!
//! ## Memory ordering
//!
//! Ring bytes are copied first, then the offset is published with a release
//! store. Offsets written by the peer are read with acquire loads before any
//! ring bytes they cover are touched.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use spin::RwLock;

use crate::error::{Result, VmciError};
use crate::handle::Handle;

/// Shared per-queue header.
#[repr(C)]
pub struct QueueHeader {
    handle: Handle,
    producer_tail: AtomicU64,
    consumer_head: AtomicU64,
}

impl QueueHeader {
    pub const fn new(handle: Handle) -> Self {
        Self {
            handle,
            producer_tail: AtomicU64::new(0),
            consumer_head: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn producer_tail(&self) -> u64 {
        self.producer_tail.load(Ordering::Acquire)
    }

    #[inline]
    pub fn consumer_head(&self) -> u64 {
        self.consumer_head.load(Ordering::Acquire)
    }

    /// Advance the producer tail by `add`, wrapping at `size`.
    ///
    /// Only the owning producer calls this, so load-then-store is enough; the
    /// peer never observes anything but a whole 64-bit value.
    #[inline]
    pub fn add_producer_tail(&self, add: u64, size: u64) {
        Self::advance(&self.producer_tail, add, size);
    }

    /// Advance the consumer head by `add`, wrapping at `size`.
    #[inline]
    pub fn add_consumer_head(&self, add: u64, size: u64) {
        Self::advance(&self.consumer_head, add, size);
    }

    fn advance(offset: &AtomicU64, add: u64, size: u64) {
        let mut value = offset.load(Ordering::Relaxed) + add;
        if value >= size {
            value -= size;
        }
        offset.store(value, Ordering::Release);
    }

    /// Force raw offsets; used when recovering state and by tests.
    pub fn set_offsets(&self, producer_tail: u64, consumer_head: u64) {
        self.producer_tail.store(producer_tail, Ordering::Release);
        self.consumer_head.store(consumer_head, Ordering::Release);
    }
}

/// Free space in a produce queue.
///
/// The tail comes from `produce`, the head from `consume`; both must lie in
/// `[0, produce_size)`.
pub fn free_space(produce: &QueueHeader, consume: &QueueHeader, produce_size: u64) -> Result<u64> {
    let tail = produce.producer_tail();
    let head = consume.consumer_head();

    if tail >= produce_size {
        return Err(VmciError::InvalidSize { offset: tail, size: produce_size });
    }
    if head >= produce_size {
        return Err(VmciError::InvalidSize { offset: head, size: produce_size });
    }

    // Deduct 1 so that tail == head always means "empty"
    Ok(if tail >= head {
        produce_size - (tail - head) - 1
    } else {
        head - tail - 1
    })
}

/// Bytes available to dequeue from a consume queue.
pub fn bytes_ready(consume: &QueueHeader, produce: &QueueHeader, consume_size: u64) -> Result<u64> {
    let free = free_space(consume, produce, consume_size)?;
    Ok(consume_size - free - 1)
}

/// Validated (tail, head) pair.
fn indexes(tail_header: &QueueHeader, head_header: &QueueHeader, size: u64) -> Result<(u64, u64)> {
    let tail = tail_header.producer_tail();
    let head = head_header.consumer_head();
    if tail >= size {
        return Err(VmciError::InvalidSize { offset: tail, size });
    }
    if head >= size {
        return Err(VmciError::InvalidSize { offset: head, size });
    }
    Ok((tail, head))
}

/// Backing memory of one queue.
pub struct QueueRegion {
    header: QueueHeader,
    ring: Box<[UnsafeCell<u8>]>,
}

// SAFETY: ring bytes are only written by the producer inside
// [tail, tail + free) and only read by the consumer inside [head, head +
// ready); the ranges are disjoint by construction of the offsets, which are
// exchanged through release/acquire atomics.
unsafe impl Sync for QueueRegion {}

impl QueueRegion {
    /// Allocate a zeroed queue of `size` bytes.
    pub fn new(handle: Handle, size: u64) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(VmciError::InvalidArgs("queue size must be non-zero"));
        }
        let len = usize::try_from(size).map_err(|_| VmciError::NoMem("queue larger than address space"))?;

        let mut ring: Vec<UnsafeCell<u8>> = Vec::new();
        ring.try_reserve_exact(len)
            .map_err(|_| VmciError::NoMem("queue memory"))?;
        ring.resize_with(len, || UnsafeCell::new(0));

        Ok(Arc::new(Self {
            header: QueueHeader::new(handle),
            ring: ring.into_boxed_slice(),
        }))
    }

    pub fn header(&self) -> &QueueHeader {
        &self.header
    }

    pub fn size(&self) -> u64 {
        self.ring.len() as u64
    }

    /// # Safety.
    ///
    /// The caller must own `[offset, offset + len)` under the ring protocol
    /// (the producer's free range) for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.ring.len());
        let base = UnsafeCell::raw_get(self.ring.as_ptr());
        core::slice::from_raw_parts_mut(base.add(offset), len)
    }

    /// # Safety.
    ///
    /// `[offset, offset + len)` must be published data the producer will not
    /// overwrite before the consumer head moves past it.
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.ring.len());
        let base = UnsafeCell::raw_get(self.ring.as_ptr());
        core::slice::from_raw_parts(base.add(offset).cast_const(), len)
    }
}

/// A queue as seen by one endpoint: the region may come and go.
///
/// Host-side mappings of guest memory can disappear while the queue pair is
/// alive (guest migration, page store teardown). `was_mapped` distinguishes
/// "not yet attached" from "temporarily gone".
pub struct QueueMapping {
    region: RwLock<Option<Arc<QueueRegion>>>,
    was_mapped: AtomicBool,
}

impl QueueMapping {
    pub fn mapped(region: Arc<QueueRegion>) -> Arc<Self> {
        Arc::new(Self {
            region: RwLock::new(Some(region)),
            was_mapped: AtomicBool::new(true),
        })
    }

    pub fn unmapped() -> Arc<Self> {
        Arc::new(Self {
            region: RwLock::new(None),
            was_mapped: AtomicBool::new(false),
        })
    }

    pub fn map(&self, region: Arc<QueueRegion>) {
        *self.region.write() = Some(region);
        self.was_mapped.store(true, Ordering::Release);
    }

    pub fn unmap(&self) -> Option<Arc<QueueRegion>> {
        self.region.write().take()
    }

    pub fn region(&self) -> Option<Arc<QueueRegion>> {
        self.region.read().clone()
    }

    pub fn is_mapped(&self) -> bool {
        self.region.read().is_some()
    }

    pub fn was_mapped(&self) -> bool {
        self.was_mapped.load(Ordering::Acquire)
    }
}

/// Both queues of a pair, mapped for the duration of one operation.
pub struct MappedQueues {
    produce: Arc<QueueRegion>,
    consume: Arc<QueueRegion>,
}

impl MappedQueues {
    pub fn new(produce: Arc<QueueRegion>, consume: Arc<QueueRegion>) -> Self {
        Self { produce, consume }
    }

    /// Borrow both regions, or explain why they are unavailable.
    pub fn map(produce: &QueueMapping, consume: &QueueMapping) -> Result<Self> {
        match (produce.region(), consume.region()) {
            (Some(produce), Some(consume)) => Ok(Self { produce, consume }),
            _ if produce.was_mapped() && consume.was_mapped() => Err(VmciError::NotReady),
            _ => Err(VmciError::NotAttached),
        }
    }

    pub fn produce_size(&self) -> u64 {
        self.produce.size()
    }

    pub fn consume_size(&self) -> u64 {
        self.consume.size()
    }

    pub fn produce_free_space(&self) -> Result<u64> {
        free_space(self.produce.header(), self.consume.header(), self.produce.size())
    }

    pub fn produce_buf_ready(&self) -> Result<u64> {
        bytes_ready(self.produce.header(), self.consume.header(), self.produce.size())
    }

    pub fn consume_free_space(&self) -> Result<u64> {
        free_space(self.consume.header(), self.produce.header(), self.consume.size())
    }

    pub fn consume_buf_ready(&self) -> Result<u64> {
        bytes_ready(self.consume.header(), self.produce.header(), self.consume.size())
    }

    /// (producer tail, consumer head) of the produce queue.
    pub fn produce_indexes(&self) -> Result<(u64, u64)> {
        indexes(self.produce.header(), self.consume.header(), self.produce.size())
    }

    /// (producer tail, consumer head) of the consume queue.
    pub fn consume_indexes(&self) -> Result<(u64, u64)> {
        indexes(self.consume.header(), self.produce.header(), self.consume.size())
    }

    pub fn enqueue(&self, buf: &[u8]) -> Result<usize> {
        self.enqueue_from(&mut SliceSource { buf }, buf.len())
    }

    pub fn enqueue_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let len = bufs.iter().map(|b| b.len()).sum();
        self.enqueue_from(&mut IoSource::new(bufs), len)
    }

    /// Copy out and advance the head.
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        self.dequeue_into(&mut SliceSink { buf }, len, true)
    }

    /// Copy out without advancing the head.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        self.dequeue_into(&mut SliceSink { buf }, len, false)
    }

    pub fn dequeue_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let len = bufs.iter().map(|b| b.len()).sum();
        self.dequeue_into(&mut IoSink::new(bufs), len, true)
    }

    pub fn peek_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let len = bufs.iter().map(|b| b.len()).sum();
        self.dequeue_into(&mut IoSink::new(bufs), len, false)
    }

    fn enqueue_from(&self, source: &mut dyn ByteSource, len: usize) -> Result<usize> {
        let size = self.produce.size();
        let free = self.produce_free_space()?;
        if free == 0 {
            return Err(VmciError::NoSpace);
        }

        let written = free.min(len as u64) as usize;
        let tail = self.produce.header().producer_tail() as usize;
        let first = written.min(size as usize - tail);

        // SAFETY: [tail, tail + written) mod size lies within the free range,
        // which the consumer does not read until the tail is published below.
        unsafe {
            source.fill(self.produce.slice_mut(tail, first));
            if written > first {
                source.fill(self.produce.slice_mut(0, written - first));
            }
        }

        self.produce.header().add_producer_tail(written as u64, size);
        Ok(written)
    }

    fn dequeue_into(&self, sink: &mut dyn ByteSink, len: usize, update_head: bool) -> Result<usize> {
        let size = self.consume.size();
        let ready = self.consume_buf_ready()?;
        if ready == 0 {
            return Err(VmciError::NoData);
        }

        let read = ready.min(len as u64) as usize;
        let head = self.produce.header().consumer_head() as usize;
        let first = read.min(size as usize - head);

        // SAFETY: [head, head + read) mod size was published by the peer's
        // tail store, and the peer will not reuse it until our head moves.
        unsafe {
            sink.drain(self.consume.slice(head, first));
            if read > first {
                sink.drain(self.consume.slice(0, read - first));
            }
        }

        if update_head {
            self.produce.header().add_consumer_head(read as u64, size);
        }
        Ok(read)
    }
}

/// Sequential reader feeding ring writes.
trait ByteSource {
    /// Fill all of `dst`.
    fn fill(&mut self, dst: &mut [u8]);
}

/// Sequential writer fed by ring reads.
trait ByteSink {
    /// Consume all of `src`.
    fn drain(&mut self, src: &[u8]);
}

struct SliceSource<'a> {
    buf: &'a [u8],
}

impl ByteSource for SliceSource<'_> {
    fn fill(&mut self, dst: &mut [u8]) {
        let (head, rest) = self.buf.split_at(dst.len());
        dst.copy_from_slice(head);
        self.buf = rest;
    }
}

struct SliceSink<'a> {
    buf: &'a mut [u8],
}

impl ByteSink for SliceSink<'_> {
    fn drain(&mut self, src: &[u8]) {
        let buf = core::mem::take(&mut self.buf);
        let (head, rest) = buf.split_at_mut(src.len());
        head.copy_from_slice(src);
        self.buf = rest;
    }
}

struct IoSource<'a, 'b> {
    bufs: &'a [IoSlice<'b>],
    index: usize,
    offset: usize,
}

impl<'a, 'b> IoSource<'a, 'b> {
    fn new(bufs: &'a [IoSlice<'b>]) -> Self {
        Self { bufs, index: 0, offset: 0 }
    }
}

impl ByteSource for IoSource<'_, '_> {
    fn fill(&mut self, mut dst: &mut [u8]) {
        while !dst.is_empty() {
            let current = &self.bufs[self.index][self.offset..];
            let n = current.len().min(dst.len());
            let (head, rest) = dst.split_at_mut(n);
            head.copy_from_slice(&current[..n]);
            dst = rest;
            self.offset += n;
            if self.offset == self.bufs[self.index].len() {
                self.index += 1;
                self.offset = 0;
            }
        }
    }
}

struct IoSink<'a, 'b> {
    bufs: &'a mut [IoSliceMut<'b>],
    index: usize,
    offset: usize,
}

impl<'a, 'b> IoSink<'a, 'b> {
    fn new(bufs: &'a mut [IoSliceMut<'b>]) -> Self {
        Self { bufs, index: 0, offset: 0 }
    }
}

impl ByteSink for IoSink<'_, '_> {
    fn drain(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let current = &mut self.bufs[self.index][self.offset..];
            let n = current.len().min(src.len());
            current[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            self.offset += n;
            if self.offset == self.bufs[self.index].len() {
                self.index += 1;
                self.offset = 0;
            }
        }
    }
}
