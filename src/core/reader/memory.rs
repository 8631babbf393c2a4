// Reader over bytes already in memory; copies straight into pool buffers on demand.
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;

use super::{ReadResult, Reader, ReaderOptions, ReaderState};
use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::pool::BufferPool;
use crate::core::waiter::{Waitable, Waiter, WaiterRef};
use crate::core::window::SeekPlan;

/// Forwards pool availability to whoever is parked on the reader.
struct Relay(Arc<Waitable>);

impl Waiter for Relay {
    fn wake(&self) {
        self.0.signal_availability();
    }
}

pub struct MemoryReader {
    name: String,
    data: Bytes,
    pool: BufferPool,
    state: Mutex<ReaderState>,
    waitable: Arc<Waitable>,
    relay: WaiterRef,
    mtime: Option<OffsetDateTime>,
}

impl MemoryReader {
    /// `options.max_buffers` is ignored; there is no read-ahead.
    pub fn new(
        name: impl Into<String>,
        pool: &BufferPool,
        data: impl Into<Bytes>,
        options: ReaderOptions,
    ) -> Self {
        let data = data.into();
        let waitable = Arc::new(Waitable::new());
        let relay: WaiterRef = Arc::new(Relay(Arc::clone(&waitable)));
        let mut reader = Self {
            name: name.into(),
            state: Mutex::new(ReaderState::new(Some(data.len() as u64))),
            data,
            pool: pool.clone(),
            waitable,
            relay,
            mtime: None,
        };
        if !pool.is_valid() {
            let fault = Fault::new(ErrorKind::Alloc, "buffer pool is invalid");
            reader.state.get_mut().fault = Some(fault);
        } else if let Err(err) = reader.seek(options.offset, options.size) {
            debug!(reader = %reader.name, error = %err, "initial positioning failed");
        }
        reader
    }

    pub fn with_mtime(mut self, mtime: Option<OffsetDateTime>) -> Self {
        self.mtime = mtime;
        self
    }
}

impl Reader for MemoryReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        self.state.lock().window.size()
    }

    fn mtime(&self) -> Option<OffsetDateTime> {
        self.mtime
    }

    fn get_buffer(&self, waiter: &WaiterRef) -> Result<ReadResult, Error> {
        let mut state = self.state.lock();
        state.check_usable()?;
        if state.eof {
            return Ok(ReadResult::Eof);
        }

        // Parked before asking the pool, so a release in between still reaches it.
        self.waitable.add_waiter(waiter);
        let Some(mut lease) = self.pool.get_buffer(&self.relay) else {
            return Ok(ReadResult::WouldBlock);
        };
        self.waitable.remove_waiter(waiter);

        let start = state.window.position().unwrap_or(0) as usize;
        let want = state.window.want(lease.spare_capacity());
        let copied = lease.append(&self.data[start..start + want]);
        state.window.advance(copied as u64)?;
        state.eof = state.window.is_exhausted();
        state.delivered = true;
        Ok(ReadResult::Buffer(lease))
    }

    fn seek(&mut self, offset: u64, size: Option<u64>) -> Result<(), Error> {
        let state = self.state.get_mut();
        let window = match state.plan_seek(offset, size, true)? {
            SeekPlan::Unchanged => return Ok(()),
            SeekPlan::Reset(window) => window,
        };
        state.reset(window);
        self.pool.remove_waiter(&self.relay);
        self.waitable.remove_waiters();
        debug!(reader = %self.name, offset, size = ?window.size(), "positioned");
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), Error> {
        let state = self.state.get_mut();
        state.check_usable()?;
        let (offset, size) = state.origin()?;
        self.seek(offset, size)
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        self.waitable.remove_waiter(waiter);
    }

    fn close(&mut self) {
        if self.state.get_mut().closed {
            return;
        }
        self.pool.remove_waiter(&self.relay);
        self.waitable.remove_waiters();
        self.state.get_mut().closed = true;
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReader")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryReader;
    use crate::core::error::ErrorKind;
    use crate::core::pool::{BufferPool, PoolOptions};
    use crate::core::reader::{ReadResult, Reader, ReaderOptions};
    use crate::core::waiter::WaiterRef;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (WaiterRef, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let waiter: WaiterRef = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (waiter, hits)
    }

    #[test]
    fn yields_window_in_buffer_sized_pieces() {
        let pool = BufferPool::new(PoolOptions::new(1, 4));
        let reader = MemoryReader::new(
            "mem",
            &pool,
            b"abcdefghij".to_vec(),
            ReaderOptions::new().with_offset(1).with_size(7),
        );
        let (waiter, _) = counting();
        let mut pieces = Vec::new();
        loop {
            match reader.get_buffer(&waiter).expect("get_buffer") {
                ReadResult::Buffer(lease) => pieces.push(lease.as_slice().to_vec()),
                ReadResult::Eof => break,
                ReadResult::WouldBlock => panic!("buffer was returned"),
            }
        }
        assert_eq!(pieces, vec![b"bcde".to_vec(), b"fgh".to_vec()]);
    }

    #[test]
    fn exhausted_pool_parks_and_wakes_consumer() {
        let pool = BufferPool::new(PoolOptions::new(1, 4));
        let reader = MemoryReader::new("mem", &pool, vec![7u8; 16], ReaderOptions::new());
        let (waiter, hits) = counting();

        let ReadResult::Buffer(held) = reader.get_buffer(&waiter).expect("first") else {
            panic!("expected buffer");
        };
        assert!(matches!(
            reader.get_buffer(&waiter).expect("second"),
            ReadResult::WouldBlock
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            reader.get_buffer(&waiter).expect("third"),
            ReadResult::Buffer(_)
        ));
    }

    #[test]
    fn empty_source_is_immediately_eof() {
        let pool = BufferPool::new(PoolOptions::new(1, 4));
        let reader = MemoryReader::new("empty", &pool, Vec::new(), ReaderOptions::new());
        let (waiter, _) = counting();
        assert!(matches!(
            reader.get_buffer(&waiter).expect("eof"),
            ReadResult::Eof
        ));
        assert_eq!(reader.size(), Some(0));
    }

    #[test]
    fn rewind_after_seek_and_close() {
        let pool = BufferPool::new(PoolOptions::new(1, 64));
        let mut reader = MemoryReader::new(
            "mem",
            &pool,
            b"0123456789".to_vec(),
            ReaderOptions::new().with_size(3),
        );
        let (waiter, _) = counting();
        reader.seek(5, None).expect("seek");
        let ReadResult::Buffer(lease) = reader.get_buffer(&waiter).expect("data") else {
            panic!("expected buffer");
        };
        assert_eq!(lease.as_slice(), b"56789");
        drop(lease);

        reader.rewind().expect("rewind");
        let ReadResult::Buffer(lease) = reader.get_buffer(&waiter).expect("data") else {
            panic!("expected buffer");
        };
        assert_eq!(lease.as_slice(), b"012");
        drop(lease);

        reader.close();
        let err = reader.get_buffer(&waiter).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
        let err = reader.seek(0, None).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
