//! Purpose: Fixed-capacity byte view over one pool slot.
//! Exports: `BoundedBuffer`.
//! Role: Primitive value type handed out by leases; readers fill it, writers drain it.
//! Invariants: `start + size <= capacity` at all times; memory is never reallocated.
//! Invariants: Not synchronized; exclusive access comes from the owning lease.
use std::fmt;
use std::ptr::{self, NonNull};
use std::slice;

pub struct BoundedBuffer {
    data: NonNull<u8>,
    capacity: usize,
    start: usize,
    size: usize,
}

// The view is only reachable through a `BufferLease`, which is the single owner of
// its slot for as long as the view exists.
unsafe impl Send for BoundedBuffer {}
unsafe impl Sync for BoundedBuffer {}

impl BoundedBuffer {
    /// # Safety
    ///
    /// `data` must point to `capacity` initialized bytes that stay valid and are not
    /// accessed through any other path while the returned view is alive.
    pub(crate) unsafe fn from_raw_parts(data: NonNull<u8>, capacity: usize) -> Self {
        Self {
            data,
            capacity,
            start: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.capacity
    }

    /// Bytes that can still be appended, counting room freed by `consume`.
    pub fn spare_capacity(&self) -> usize {
        self.capacity - self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `start + size <= capacity` and the region is owned by this view.
        unsafe { slice::from_raw_parts(self.data.as_ptr().add(self.start), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr().add(self.start), self.size) }
    }

    /// Returns up to `max` writable bytes directly after the stored data.
    ///
    /// Stored bytes are moved to the front first when the tail is too short. Call
    /// `commit` with the number of bytes actually written.
    pub fn spare_mut(&mut self, max: usize) -> &mut [u8] {
        let want = max.min(self.spare_capacity());
        if self.start + self.size + want > self.capacity {
            self.compact();
        }
        let tail = self.start + self.size;
        // SAFETY: `tail + want <= capacity` after compaction.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr().add(tail), want) }
    }

    /// Marks `n` bytes previously written through `spare_mut` as stored.
    ///
    /// Clamped to the room after the stored data; returns the count committed.
    pub fn commit(&mut self, n: usize) -> usize {
        let n = n.min(self.capacity - self.start - self.size);
        self.size += n;
        n
    }

    /// Copies as much of `bytes` as fits and returns the number copied.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.spare_capacity());
        let dst = self.spare_mut(n);
        dst.copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Drops `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.size);
        self.size -= n;
        if self.size == 0 {
            self.start = 0;
        } else {
            self.start += n;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.size = 0;
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        // SAFETY: both ranges lie inside the slot; `ptr::copy` handles overlap.
        unsafe {
            let base = self.data.as_ptr();
            ptr::copy(base.add(self.start), base, self.size);
        }
        self.start = 0;
    }
}

impl fmt::Debug for BoundedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .finish()
    }
}
