//! Purpose: Reader contract and the state shared by every reader variant.
//! Exports: `Reader`, `ReadResult`, `ReaderOptions`, `AnyReader`, `FileReader`, `MemoryReader`.
//! Role: Producer side of the pipeline; yields filled pool buffers in source order.
//! Invariants: `get_buffer` never blocks; `WouldBlock` parks the waiter for one notification.
//! Invariants: A fault is permanent; after `close` every call reports `ErrorKind::Closed`.
use std::collections::VecDeque;

use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::pool::BufferLease;
use crate::core::waiter::WaiterRef;
use crate::core::window::{SeekPlan, Window};

mod file;
mod memory;

pub use file::FileReader;
pub use memory::MemoryReader;

pub const DEFAULT_MAX_BUFFERS: usize = 4;

#[derive(Debug)]
pub enum ReadResult {
    Buffer(BufferLease),
    Eof,
    WouldBlock,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReaderOptions {
    pub offset: u64,
    pub size: Option<u64>,
    pub max_buffers: usize,
}

impl ReaderOptions {
    pub fn new() -> Self {
        Self {
            offset: 0,
            size: None,
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Reader {
    fn name(&self) -> &str;

    fn seekable(&self) -> bool;

    /// Size of the current window; `None` when it runs to an unknown end.
    fn size(&self) -> Option<u64>;

    fn mtime(&self) -> Option<OffsetDateTime>;

    /// Takes the next filled buffer.
    ///
    /// `Eof` means the window has been delivered completely. After `WouldBlock`, do
    /// not call again until `waiter` has been woken.
    fn get_buffer(&self, waiter: &WaiterRef) -> Result<ReadResult, Error>;

    /// Repositions to `[offset, offset + size)`, or to the end of the source when
    /// `size` is `None`. A failed seek leaves the reader faulted; close it.
    fn seek(&mut self, offset: u64, size: Option<u64>) -> Result<(), Error>;

    /// Returns to the window the reader was opened with.
    fn rewind(&mut self) -> Result<(), Error>;

    fn remove_waiter(&self, waiter: &WaiterRef);

    /// Stops background work and returns every held buffer. Blocks until done.
    fn close(&mut self);
}

#[derive(Debug)]
pub(crate) struct ReaderState {
    pub(crate) queue: VecDeque<BufferLease>,
    pub(crate) window: Window,
    pub(crate) origin: Option<(u64, Option<u64>)>,
    pub(crate) delivered: bool,
    pub(crate) eof: bool,
    pub(crate) quit: bool,
    pub(crate) closed: bool,
    pub(crate) fault: Option<Fault>,
}

impl ReaderState {
    pub(crate) fn new(max_size: Option<u64>) -> Self {
        Self {
            queue: VecDeque::new(),
            window: Window::unpositioned(max_size),
            origin: None,
            delivered: false,
            eof: false,
            quit: false,
            closed: false,
            fault: None,
        }
    }

    pub(crate) fn check_usable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("reader is closed"));
        }
        match &self.fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    /// Records `err` as the permanent fault and hands it back for propagation.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if self.fault.is_none() {
            self.fault = Some(Fault::from(&err));
        }
        err
    }

    pub(crate) fn plan_seek(
        &mut self,
        offset: u64,
        size: Option<u64>,
        seekable: bool,
    ) -> Result<SeekPlan, Error> {
        self.check_usable()?;
        self.window
            .plan(offset, size, self.delivered, seekable)
            .map_err(|err| self.fail(err))
    }

    /// Installs `window` and hands back the queued leases. The caller must drop them
    /// after releasing the state lock.
    pub(crate) fn reset(&mut self, window: Window) -> VecDeque<BufferLease> {
        if self.origin.is_none() {
            if let Some(start) = window.start() {
                self.origin = Some((start, window.size()));
            }
        }
        self.window = window;
        self.eof = window.is_exhausted();
        self.delivered = false;
        std::mem::take(&mut self.queue)
    }

    pub(crate) fn origin(&self) -> Result<(u64, Option<u64>), Error> {
        self.origin
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("reader was never positioned"))
    }
}

/// The closed set of reader implementations.
#[derive(Debug)]
pub enum AnyReader {
    File(FileReader),
    Memory(MemoryReader),
}

impl From<FileReader> for AnyReader {
    fn from(reader: FileReader) -> Self {
        Self::File(reader)
    }
}

impl From<MemoryReader> for AnyReader {
    fn from(reader: MemoryReader) -> Self {
        Self::Memory(reader)
    }
}

impl Reader for AnyReader {
    fn name(&self) -> &str {
        match self {
            Self::File(reader) => reader.name(),
            Self::Memory(reader) => reader.name(),
        }
    }

    fn seekable(&self) -> bool {
        match self {
            Self::File(reader) => reader.seekable(),
            Self::Memory(reader) => reader.seekable(),
        }
    }

    fn size(&self) -> Option<u64> {
        match self {
            Self::File(reader) => reader.size(),
            Self::Memory(reader) => reader.size(),
        }
    }

    fn mtime(&self) -> Option<OffsetDateTime> {
        match self {
            Self::File(reader) => reader.mtime(),
            Self::Memory(reader) => reader.mtime(),
        }
    }

    fn get_buffer(&self, waiter: &WaiterRef) -> Result<ReadResult, Error> {
        match self {
            Self::File(reader) => reader.get_buffer(waiter),
            Self::Memory(reader) => reader.get_buffer(waiter),
        }
    }

    fn seek(&mut self, offset: u64, size: Option<u64>) -> Result<(), Error> {
        match self {
            Self::File(reader) => reader.seek(offset, size),
            Self::Memory(reader) => reader.seek(offset, size),
        }
    }

    fn rewind(&mut self) -> Result<(), Error> {
        match self {
            Self::File(reader) => reader.rewind(),
            Self::Memory(reader) => reader.rewind(),
        }
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        match self {
            Self::File(reader) => reader.remove_waiter(waiter),
            Self::Memory(reader) => reader.remove_waiter(waiter),
        }
    }

    fn close(&mut self) {
        match self {
            Self::File(reader) => reader.close(),
            Self::Memory(reader) => reader.close(),
        }
    }
}
