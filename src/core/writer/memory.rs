// Writer into a shared in-memory sink. Everything happens on the caller's thread.
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{Progress, ProgressFn, Writer, WriterOptions, WriterState, foreign_lease};
use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::pool::{BufferLease, BufferPool};
use crate::core::waiter::{Waitable, WaiterRef};

/// Growable byte sink shared between a memory writer and whoever reads the result.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    bytes: Arc<Mutex<BytesMut>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Copy of the current contents.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes.lock())
    }

    /// Takes the contents, leaving the sink empty.
    pub fn take(&self) -> Bytes {
        self.bytes.lock().split().freeze()
    }

    fn truncate(&self, len: usize) {
        self.bytes.lock().truncate(len);
    }

    fn extend(&self, data: &[u8]) {
        self.bytes.lock().extend_from_slice(data);
    }

    fn reserve(&self, additional: usize) {
        self.bytes.lock().reserve(additional);
    }
}

pub struct MemoryWriter {
    name: String,
    pool: BufferPool,
    sink: MemorySink,
    limit: Option<u64>,
    progress: Option<ProgressFn>,
    state: Mutex<WriterState>,
    waitable: Waitable,
    mtime: Option<OffsetDateTime>,
}

impl MemoryWriter {
    /// Writes start at `options.offset`; anything in `sink` past it is discarded.
    pub fn new(
        name: impl Into<String>,
        pool: &BufferPool,
        sink: MemorySink,
        options: WriterOptions,
    ) -> Self {
        let mut state = WriterState::default();
        if !pool.is_valid() {
            state.fault = Some(Fault::new(ErrorKind::Alloc, "buffer pool is invalid"));
        } else {
            match usize::try_from(options.offset) {
                Ok(offset) if offset <= sink.len() => sink.truncate(offset),
                _ => {
                    state.fault = Some(Fault::new(
                        ErrorKind::Usage,
                        format!("offset {} is past the end of the sink", options.offset),
                    ));
                }
            }
        }
        Self {
            name: name.into(),
            pool: pool.clone(),
            sink,
            limit: options.size,
            progress: options.progress,
            state: Mutex::new(state),
            waitable: Waitable::new(),
            mtime: None,
        }
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }

    pub fn mtime(&self) -> Option<OffsetDateTime> {
        self.mtime
    }
}

impl Writer for MemoryWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_buffer(&self, lease: BufferLease, _waiter: &WaiterRef) -> Result<Progress, Error> {
        if !self.pool.owns(&lease) {
            return Err(foreign_lease());
        }
        let mut state = self.state.lock();
        let len = lease.len() as u64;
        state.admit(len, self.limit)?;
        self.sink.extend(lease.as_slice());
        state.written += len;
        if let Some(progress) = &self.progress {
            if len > 0 {
                progress(len);
            }
        }
        Ok(Progress::Ready)
    }

    fn finalize(&self, _waiter: &WaiterRef) -> Result<Progress, Error> {
        let mut state = self.state.lock();
        if state.finalized && !state.closed {
            return Ok(Progress::Ready);
        }
        state.check_usable()?;
        state.finalizing = true;
        state.finalized = true;
        Ok(Progress::Ready)
    }

    fn preallocate(&mut self, size: u64) -> Result<(), Error> {
        let state = self.state.get_mut();
        state.check_preallocate()?;
        let additional = usize::try_from(size).map_err(|_| {
            state.fail(Error::new(ErrorKind::Overflow).with_message("preallocation exceeds address space"))
        })?;
        self.sink.reserve(additional);
        state.preallocated = true;
        Ok(())
    }

    fn set_mtime(&mut self, mtime: OffsetDateTime) -> Result<(), Error> {
        let state = self.state.get_mut();
        state.check_usable()?;
        if !state.finalized {
            return Err(Error::new(ErrorKind::Usage).with_message("mtime can only be set after finalize"));
        }
        self.mtime = Some(mtime);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.state.lock().written
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        self.waitable.remove_waiter(waiter);
    }

    fn close(&mut self) {
        self.waitable.remove_waiters();
        self.state.get_mut().closed = true;
    }
}

impl fmt::Debug for MemoryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWriter")
            .field("name", &self.name)
            .field("written", &self.written())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemorySink, MemoryWriter};
    use crate::core::error::ErrorKind;
    use crate::core::pool::{BufferPool, PoolOptions};
    use crate::core::waiter::WaiterRef;
    use crate::core::writer::{Progress, Writer, WriterOptions};
    use std::sync::Arc;

    fn noop() -> WaiterRef {
        Arc::new(|| {})
    }

    #[test]
    fn appends_in_order_and_returns_leases() {
        let pool = BufferPool::new(PoolOptions::new(2, 8));
        let sink = MemorySink::new();
        let writer = MemoryWriter::new("mem", &pool, sink.clone(), WriterOptions::new());
        let waiter = noop();
        for chunk in [&b"abc"[..], b"", b"defgh"] {
            let mut lease = pool.get_buffer(&waiter).expect("buffer");
            lease.append(chunk);
            assert_eq!(writer.add_buffer(lease, &waiter).expect("add"), Progress::Ready);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(writer.finalize(&waiter).expect("finalize"), Progress::Ready);
        assert_eq!(writer.written(), 8);
        assert_eq!(sink.to_bytes().as_ref(), b"abcdefgh");
        assert_eq!(sink.take().as_ref(), b"abcdefgh");
        assert!(sink.is_empty());
    }

    #[test]
    fn offset_truncates_existing_contents() {
        let pool = BufferPool::new(PoolOptions::new(1, 8));
        let sink = MemorySink::new();
        let waiter = noop();
        {
            let writer = MemoryWriter::new("mem", &pool, sink.clone(), WriterOptions::new());
            let mut lease = pool.get_buffer(&waiter).expect("buffer");
            lease.append(b"12345678");
            writer.add_buffer(lease, &waiter).expect("add");
        }
        let writer = MemoryWriter::new("mem", &pool, sink.clone(), WriterOptions::new().with_offset(3));
        let mut lease = pool.get_buffer(&waiter).expect("buffer");
        lease.append(b"xy");
        writer.add_buffer(lease, &waiter).expect("add");
        assert_eq!(sink.to_bytes().as_ref(), b"123xy");

        let writer = MemoryWriter::new("mem", &pool, sink, WriterOptions::new().with_offset(50));
        let err = writer.finalize(&waiter).expect_err("offset past end");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn closed_writer_rejects_calls() {
        let pool = BufferPool::new(PoolOptions::new(1, 8));
        let mut writer = MemoryWriter::new("mem", &pool, MemorySink::new(), WriterOptions::new());
        let waiter = noop();
        writer.preallocate(1024).expect("preallocate");
        writer.close();
        let err = writer.finalize(&waiter).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
