// Fixed slab of page-padded buffers handed out as exclusive, move-only leases.
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::buffer::BoundedBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::waiter::{Waitable, WaiterRef};

const FALLBACK_PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolOptions {
    pub buffer_count: usize,
    pub buffer_size: usize,
}

impl PoolOptions {
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            buffer_count,
            buffer_size,
        }
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

struct Slab {
    base: NonNull<u8>,
    layout: Layout,
    page: usize,
    stride: usize,
}

// The slab is plain memory; slot exclusivity is enforced by the free list.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Lays out `count` slots, each padded to whole pages and followed by a guard
    /// page, behind one leading guard page.
    fn allocate(count: usize, buffer_size: usize) -> Result<Self, Error> {
        if count == 0 || buffer_size == 0 {
            return Err(Error::new(ErrorKind::Alloc)
                .with_message("buffer count and buffer size must be non-zero"));
        }
        let page = page_size();
        let overflow = || Error::new(ErrorKind::Alloc).with_message("pool size overflows");
        let padded = buffer_size
            .checked_next_multiple_of(page)
            .ok_or_else(overflow)?;
        let stride = padded.checked_add(page).ok_or_else(overflow)?;
        let total = stride
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(page))
            .ok_or_else(overflow)?;
        let layout = Layout::from_size_align(total, page).map_err(|err| {
            Error::new(ErrorKind::Alloc)
                .with_message("invalid pool layout")
                .with_source(err)
        })?;
        // Zeroed so that slots can be handed out as initialized `&mut [u8]`.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            Error::new(ErrorKind::Alloc).with_message(format!("failed to allocate {total} bytes"))
        })?;
        Ok(Self {
            base,
            layout,
            page,
            stride,
        })
    }

    fn slot(&self, index: usize) -> NonNull<u8> {
        // SAFETY: callers only pass indices below the slot count used at allocation.
        unsafe { self.base.add(self.page + index * self.stride) }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

struct PoolShared {
    slab: Option<Slab>,
    buffer_count: usize,
    buffer_size: usize,
    free: Mutex<Vec<usize>>,
    waiters: Waitable,
}

impl PoolShared {
    fn release(&self, slot: usize) {
        {
            let mut free = self.free.lock();
            debug_assert!(!free.contains(&slot), "slot {slot} released twice");
            free.push(slot);
        }
        self.waiters.signal_availability();
    }
}

/// Shared handle to a fixed set of buffers.
///
/// Cloning the handle is cheap; all clones hand out leases from the same slab.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Builds the pool. On failure the pool is returned in the invalid state.
    pub fn new(options: PoolOptions) -> Self {
        match Self::try_new(options) {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!(
                    buffer_count = options.buffer_count,
                    buffer_size = options.buffer_size,
                    error = %err,
                    "buffer pool allocation failed"
                );
                Self::from_parts(None, options)
            }
        }
    }

    pub fn try_new(options: PoolOptions) -> Result<Self, Error> {
        let slab = Slab::allocate(options.buffer_count, options.buffer_size)?;
        Ok(Self::from_parts(Some(slab), options))
    }

    fn from_parts(slab: Option<Slab>, options: PoolOptions) -> Self {
        let free = if slab.is_some() {
            (0..options.buffer_count).rev().collect()
        } else {
            Vec::new()
        };
        Self {
            shared: Arc::new(PoolShared {
                slab,
                buffer_count: options.buffer_count,
                buffer_size: options.buffer_size,
                free: Mutex::new(free),
                waiters: Waitable::new(),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.shared.slab.is_some()
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.buffer_count
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Leases a free buffer, or parks `waiter` and returns `None`.
    ///
    /// A parked waiter is woken once when a buffer is returned. Wakeup order among
    /// parked waiters is unspecified. An invalid pool never parks anybody.
    pub fn get_buffer(&self, waiter: &WaiterRef) -> Option<BufferLease> {
        let slab = self.shared.slab.as_ref()?;
        let mut free = self.shared.free.lock();
        match free.pop() {
            Some(slot) => {
                drop(free);
                // SAFETY: the slot just left the free list, so nothing else can
                // reach its memory until this lease gives it back.
                let buffer =
                    unsafe { BoundedBuffer::from_raw_parts(slab.slot(slot), self.shared.buffer_size) };
                Some(BufferLease {
                    buffer,
                    slot,
                    pool: Arc::clone(&self.shared),
                })
            }
            None => {
                self.shared.waiters.add_waiter(waiter);
                None
            }
        }
    }

    pub fn remove_waiter(&self, waiter: &WaiterRef) {
        self.shared.waiters.remove_waiter(waiter);
    }

    pub fn owns(&self, lease: &BufferLease) -> bool {
        Arc::ptr_eq(&self.shared, &lease.pool)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("valid", &self.is_valid())
            .field("buffer_count", &self.shared.buffer_count)
            .field("buffer_size", &self.shared.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive ownership of one pool buffer. Returns it to the pool on drop.
pub struct BufferLease {
    buffer: BoundedBuffer,
    slot: usize,
    pool: Arc<PoolShared>,
}

impl BufferLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Gives the buffer back now. Same as dropping the lease.
    pub fn release(self) {}
}

impl Deref for BufferLease {
    type Target = BoundedBuffer;

    fn deref(&self) -> &BoundedBuffer {
        &self.buffer
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut BoundedBuffer {
        &mut self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("slot", &self.slot)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferPool, PoolOptions};
    use crate::core::error::ErrorKind;
    use crate::core::waiter::WaiterRef;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting() -> (WaiterRef, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let waiter: WaiterRef = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (waiter, hits)
    }

    #[test]
    fn leases_are_distinct_and_bounded() {
        let pool = BufferPool::new(PoolOptions::new(3, 1000));
        assert!(pool.is_valid());
        let (waiter, hits) = counting();

        let leases: Vec<_> = (0..3)
            .map(|_| pool.get_buffer(&waiter).expect("lease"))
            .collect();
        let slots: HashSet<_> = leases.iter().map(|lease| lease.slot()).collect();
        assert_eq!(slots.len(), 3);
        assert!(leases.iter().all(|lease| lease.capacity() == 1000));
        assert_eq!(pool.available(), 0);

        assert!(pool.get_buffer(&waiter).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        drop(leases);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn released_buffer_comes_back_empty() {
        let pool = BufferPool::new(PoolOptions::new(1, 16));
        let (waiter, _) = counting();
        let mut lease = pool.get_buffer(&waiter).expect("lease");
        lease.append(b"payload");
        lease.release();

        let lease = pool.get_buffer(&waiter).expect("lease");
        assert!(lease.is_empty());
        assert_eq!(lease.spare_capacity(), 16);
    }

    #[test]
    fn zero_sized_pool_is_invalid() {
        let pool = BufferPool::new(PoolOptions::new(0, 4096));
        assert!(!pool.is_valid());
        let (waiter, _) = counting();
        assert!(pool.get_buffer(&waiter).is_none());
        assert_eq!(pool.shared.waiters.parked(), 0);

        let err = BufferPool::try_new(PoolOptions::new(4, 0)).expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Alloc);
    }

    #[test]
    fn oversized_pool_fails_softly() {
        let pool = BufferPool::new(PoolOptions::new(usize::MAX / 2, usize::MAX / 2));
        assert!(!pool.is_valid());
    }

    #[test]
    fn slots_do_not_overlap() {
        let pool = BufferPool::new(PoolOptions::new(4, 100));
        let (waiter, _) = counting();
        let mut leases: Vec<_> = (0..4)
            .map(|_| pool.get_buffer(&waiter).expect("lease"))
            .collect();
        for (i, lease) in leases.iter_mut().enumerate() {
            let fill = [i as u8; 100];
            lease.append(&fill);
        }
        for (i, lease) in leases.iter().enumerate() {
            assert!(lease.as_slice().iter().all(|byte| *byte == i as u8));
        }
    }

    #[test]
    fn lease_from_other_pool_is_not_owned() {
        let first = BufferPool::new(PoolOptions::new(1, 8));
        let second = BufferPool::new(PoolOptions::new(1, 8));
        let (waiter, _) = counting();
        let lease = first.get_buffer(&waiter).expect("lease");
        assert!(first.owns(&lease));
        assert!(first.clone().owns(&lease));
        assert!(!second.owns(&lease));
    }

    #[test]
    fn concurrent_leasing_never_exceeds_count() {
        let pool = BufferPool::new(PoolOptions::new(4, 64));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let outstanding = Arc::clone(&outstanding);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let waiter: WaiterRef = Arc::new(|| {});
                    let mut taken = 0;
                    while taken < 500 {
                        let Some(lease) = pool.get_buffer(&waiter) else {
                            pool.remove_waiter(&waiter);
                            thread::yield_now();
                            continue;
                        };
                        let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        drop(lease);
                        taken += 1;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker");
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.available(), 4);
    }
}
