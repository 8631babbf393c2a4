//! Purpose: Drive readers and writers from an ordinary thread by parking on their waiters.
//! Exports: `Parker`, `copy`, `drain`, `read_to_end`, `write_all`.
//! Role: Test and CLI harness; an event loop would post wakeups instead of parking.
//! Invariants: A wakeup that arrives before `park` is not lost; it is consumed by the next park.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::error::{Error, ErrorKind};
use crate::core::pool::BufferPool;
use crate::core::reader::{ReadResult, Reader};
use crate::core::waiter::{Waiter, WaiterRef};
use crate::core::writer::{Progress, Writer};

#[derive(Default)]
struct Signal {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Waiter for Signal {
    fn wake(&self) {
        *self.ready.lock() = true;
        self.cond.notify_one();
    }
}

/// A waiter that the owning thread can block on.
#[derive(Clone)]
pub struct Parker {
    signal: Arc<Signal>,
    waiter: WaiterRef,
}

impl Parker {
    pub fn new() -> Self {
        let signal = Arc::new(Signal::default());
        let waiter: WaiterRef = signal.clone();
        Self { signal, waiter }
    }

    pub fn waiter(&self) -> &WaiterRef {
        &self.waiter
    }

    /// Blocks until woken, consuming the wakeup.
    pub fn park(&self) {
        let mut ready = self.signal.ready.lock();
        while !*ready {
            self.signal.cond.wait(&mut ready);
        }
        *ready = false;
    }

    /// Like `park`, but gives up after `timeout`. Returns whether a wakeup was consumed.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.signal.ready.lock();
        if !*ready {
            let _ = self.signal.cond.wait_for(&mut ready, timeout);
        }
        std::mem::replace(&mut *ready, false)
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams every buffer of `reader` into `visit`, returning the byte count.
pub fn drain<R>(reader: &R, mut visit: impl FnMut(&[u8])) -> Result<u64, Error>
where
    R: Reader + ?Sized,
{
    let parker = Parker::new();
    let mut total = 0u64;
    loop {
        match reader.get_buffer(parker.waiter())? {
            ReadResult::Buffer(lease) => {
                total += lease.len() as u64;
                visit(lease.as_slice());
            }
            ReadResult::Eof => return Ok(total),
            ReadResult::WouldBlock => parker.park(),
        }
    }
}

pub fn read_to_end<R>(reader: &R) -> Result<Vec<u8>, Error>
where
    R: Reader + ?Sized,
{
    let mut out = Vec::new();
    drain(reader, |bytes| out.extend_from_slice(bytes))?;
    Ok(out)
}

/// Moves everything `reader` produces into `writer`, then finalizes the writer.
pub fn copy<R, W>(reader: &R, writer: &W) -> Result<u64, Error>
where
    R: Reader + ?Sized,
    W: Writer + ?Sized,
{
    let parker = Parker::new();
    let waiter = parker.waiter();
    let mut copied = 0u64;
    loop {
        match reader.get_buffer(waiter)? {
            ReadResult::Buffer(lease) => {
                copied += lease.len() as u64;
                if writer.add_buffer(lease, waiter)? == Progress::WouldBlock {
                    parker.park();
                }
            }
            ReadResult::Eof => break,
            ReadResult::WouldBlock => parker.park(),
        }
    }
    finalize(writer, &parker)?;
    Ok(copied)
}

/// Copies `data` into leases from `pool`, hands them to `writer` and finalizes it.
pub fn write_all<W>(pool: &BufferPool, writer: &W, data: &[u8]) -> Result<u64, Error>
where
    W: Writer + ?Sized,
{
    if !pool.is_valid() {
        return Err(Error::new(ErrorKind::Alloc).with_message("buffer pool is invalid"));
    }
    let parker = Parker::new();
    let waiter = parker.waiter();
    let mut rest = data;
    while !rest.is_empty() {
        let Some(mut lease) = pool.get_buffer(waiter) else {
            parker.park();
            continue;
        };
        let n = lease.append(rest);
        rest = &rest[n..];
        if writer.add_buffer(lease, waiter)? == Progress::WouldBlock {
            parker.park();
        }
    }
    finalize(writer, &parker)?;
    Ok(data.len() as u64)
}

fn finalize<W>(writer: &W, parker: &Parker) -> Result<(), Error>
where
    W: Writer + ?Sized,
{
    while writer.finalize(parker.waiter())? == Progress::WouldBlock {
        parker.park();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Parker, copy, read_to_end, write_all};
    use crate::core::pool::{BufferPool, PoolOptions};
    use crate::core::reader::{MemoryReader, ReaderOptions};
    use crate::core::writer::{MemorySink, MemoryWriter, WriterOptions};
    use std::time::Duration;

    #[test]
    fn early_wakeup_is_kept_for_next_park() {
        let parker = Parker::new();
        parker.waiter().wake();
        parker.park();
        assert!(!parker.park_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wakeup_from_other_thread_unparks() {
        let parker = Parker::new();
        let remote = parker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.waiter().wake();
        });
        assert!(parker.park_timeout(Duration::from_secs(10)));
        handle.join().expect("join");
    }

    #[test]
    fn copy_between_memory_endpoints() {
        let pool = BufferPool::new(PoolOptions::new(2, 7));
        let data: Vec<u8> = (0..100u8).collect();
        let reader = MemoryReader::new("src", &pool, data.clone(), ReaderOptions::new());
        let sink = MemorySink::new();
        let writer = MemoryWriter::new("dst", &pool, sink.clone(), WriterOptions::new());
        assert_eq!(copy(&reader, &writer).expect("copy"), 100);
        assert_eq!(sink.to_bytes().as_ref(), data.as_slice());

        let reader = MemoryReader::new("again", &pool, sink.take(), ReaderOptions::new().with_offset(90));
        assert_eq!(read_to_end(&reader).expect("read"), &data[90..]);
    }

    #[test]
    fn write_all_chunks_through_pool() {
        let pool = BufferPool::new(PoolOptions::new(1, 3));
        let sink = MemorySink::new();
        let writer = MemoryWriter::new("dst", &pool, sink.clone(), WriterOptions::new());
        assert_eq!(write_all(&pool, &writer, b"hello world").expect("write"), 11);
        assert_eq!(sink.to_bytes().as_ref(), b"hello world");
        assert_eq!(pool.available(), 1);
    }
}
