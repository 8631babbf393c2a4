//! Purpose: Writer contract and the bookkeeping shared by every writer variant.
//! Exports: `Writer`, `Progress`, `WriterOptions`, `ProgressFn`, `AnyWriter`, `FileWriter`,
//! `MemoryWriter`, `MemorySink`.
//! Role: Consumer side of the pipeline; accepts filled leases and drains them into a sink.
//! Invariants: Bytes reach the sink in `add_buffer` order; `finalize` completes only after
//! every accepted lease has been flushed.
//! Invariants: A fault is permanent; after `close` every call reports `ErrorKind::Closed`.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::pool::BufferLease;
use crate::core::waiter::WaiterRef;

mod file;
mod memory;

pub use file::FileWriter;
pub use memory::{MemorySink, MemoryWriter};

pub const DEFAULT_MAX_BUFFERS: usize = 4;

/// Invoked with the size of every chunk that reached the sink. Runs on the worker
/// thread; keep it to accounting.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    Ready,
    WouldBlock,
}

#[derive(Clone)]
pub struct WriterOptions {
    pub offset: u64,
    pub max_buffers: usize,
    pub fsync: bool,
    /// Declared total; accepting more than this is an overflow.
    pub size: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl WriterOptions {
    pub fn new() -> Self {
        Self {
            offset: 0,
            max_buffers: DEFAULT_MAX_BUFFERS,
            fsync: false,
            size: None,
            progress: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub(crate) fn effective_max_buffers(&self) -> usize {
        if self.max_buffers == 0 {
            DEFAULT_MAX_BUFFERS
        } else {
            self.max_buffers
        }
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterOptions")
            .field("offset", &self.offset)
            .field("max_buffers", &self.max_buffers)
            .field("fsync", &self.fsync)
            .field("size", &self.size)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

pub trait Writer {
    fn name(&self) -> &str;

    /// Hands a filled lease to the writer.
    ///
    /// The lease is always taken, even on `WouldBlock`; that result only asks the
    /// caller to hold further buffers until `waiter` is woken.
    fn add_buffer(&self, lease: BufferLease, waiter: &WaiterRef) -> Result<Progress, Error>;

    /// Starts or polls two-phase completion. `Ready` once everything is flushed (and
    /// synced, when requested). Calling again after completion returns `Ready`.
    fn finalize(&self, waiter: &WaiterRef) -> Result<Progress, Error>;

    /// Extends the sink by `size` bytes ahead of the write position. Only valid before
    /// the first buffer and before finalize.
    fn preallocate(&mut self, size: u64) -> Result<(), Error>;

    /// Stamps the sink's modification time. Only valid after finalize completed.
    fn set_mtime(&mut self, mtime: OffsetDateTime) -> Result<(), Error>;

    /// Bytes that have reached the sink.
    fn written(&self) -> u64;

    fn remove_waiter(&self, waiter: &WaiterRef);

    /// Stops background work, returns every held buffer and applies cleanup.
    fn close(&mut self);
}

#[derive(Debug, Default)]
pub(crate) struct WriterState {
    pub(crate) queue: VecDeque<BufferLease>,
    pub(crate) in_flight: bool,
    pub(crate) accepted: u64,
    pub(crate) written: u64,
    pub(crate) preallocated: bool,
    pub(crate) finalizing: bool,
    pub(crate) finalized: bool,
    pub(crate) quit: bool,
    pub(crate) closed: bool,
    pub(crate) fault: Option<Fault>,
}

impl WriterState {
    pub(crate) fn check_usable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("writer is closed"));
        }
        match &self.fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if self.fault.is_none() {
            self.fault = Some(Fault::from(&err));
        }
        err
    }

    /// Admits `len` more bytes against the declared `limit`.
    pub(crate) fn admit(&mut self, len: u64, limit: Option<u64>) -> Result<(), Error> {
        self.check_usable()?;
        if self.finalizing {
            return Err(Error::new(ErrorKind::Usage).with_message("buffer added after finalize"));
        }
        let total = self.accepted.saturating_add(len);
        if let Some(limit) = limit {
            if total > limit {
                let err = Error::new(ErrorKind::Overflow)
                    .with_message(format!("{total} bytes exceed declared size {limit}"));
                return Err(self.fail(err));
            }
        }
        self.accepted = total;
        Ok(())
    }

    /// Leases the writer holds: queued ones plus the one being flushed.
    pub(crate) fn held(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight)
    }

    pub(crate) fn check_preallocate(&mut self) -> Result<(), Error> {
        self.check_usable()?;
        if self.accepted > 0 || self.finalizing {
            let err = Error::new(ErrorKind::Usage)
                .with_message("preallocate must precede the first buffer and finalize");
            return Err(self.fail(err));
        }
        Ok(())
    }
}

pub(crate) fn foreign_lease() -> Error {
    Error::new(ErrorKind::Usage).with_message("buffer belongs to a different pool")
}

/// The closed set of writer implementations.
#[derive(Debug)]
pub enum AnyWriter {
    File(FileWriter),
    Memory(MemoryWriter),
}

impl From<FileWriter> for AnyWriter {
    fn from(writer: FileWriter) -> Self {
        Self::File(writer)
    }
}

impl From<MemoryWriter> for AnyWriter {
    fn from(writer: MemoryWriter) -> Self {
        Self::Memory(writer)
    }
}

impl Writer for AnyWriter {
    fn name(&self) -> &str {
        match self {
            Self::File(writer) => writer.name(),
            Self::Memory(writer) => writer.name(),
        }
    }

    fn add_buffer(&self, lease: BufferLease, waiter: &WaiterRef) -> Result<Progress, Error> {
        match self {
            Self::File(writer) => writer.add_buffer(lease, waiter),
            Self::Memory(writer) => writer.add_buffer(lease, waiter),
        }
    }

    fn finalize(&self, waiter: &WaiterRef) -> Result<Progress, Error> {
        match self {
            Self::File(writer) => writer.finalize(waiter),
            Self::Memory(writer) => writer.finalize(waiter),
        }
    }

    fn preallocate(&mut self, size: u64) -> Result<(), Error> {
        match self {
            Self::File(writer) => writer.preallocate(size),
            Self::Memory(writer) => writer.preallocate(size),
        }
    }

    fn set_mtime(&mut self, mtime: OffsetDateTime) -> Result<(), Error> {
        match self {
            Self::File(writer) => writer.set_mtime(mtime),
            Self::Memory(writer) => writer.set_mtime(mtime),
        }
    }

    fn written(&self) -> u64 {
        match self {
            Self::File(writer) => writer.written(),
            Self::Memory(writer) => writer.written(),
        }
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        match self {
            Self::File(writer) => writer.remove_waiter(waiter),
            Self::Memory(writer) => writer.remove_waiter(waiter),
        }
    }

    fn close(&mut self) {
        match self {
            Self::File(writer) => writer.close(),
            Self::Memory(writer) => writer.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{WriterOptions, WriterState};
    use crate::core::error::ErrorKind;

    #[test]
    fn admit_enforces_declared_size() {
        let mut state = WriterState::default();
        state.admit(60, Some(100)).expect("first");
        let err = state.admit(41, Some(100)).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Overflow);
        let err = state.admit(1, Some(100)).expect_err("sticky");
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn admit_after_finalize_is_usage_error() {
        let mut state = WriterState {
            finalizing: true,
            ..WriterState::default()
        };
        let err = state.admit(1, None).expect_err("finalizing");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(state.fault.is_none());
    }

    #[test]
    fn preallocate_only_before_data() {
        let mut state = WriterState::default();
        state.check_preallocate().expect("fresh");
        state.admit(5, None).expect("admit");
        let err = state.check_preallocate().expect_err("late");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn zero_max_buffers_falls_back_to_default() {
        let options = WriterOptions::new().with_max_buffers(0);
        assert_eq!(options.effective_max_buffers(), super::DEFAULT_MAX_BUFFERS);
        let options = WriterOptions::new().with_progress(|_| {});
        assert!(format!("{options:?}").contains("progress: true"));
    }
}
