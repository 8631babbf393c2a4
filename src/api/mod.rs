//! Purpose: Define the stable public Rust API boundary for leaseio.
//! Exports: Pool, reader, writer and factory types plus the blocking drivers.
//! Role: Public, additive-only surface used by the CLI and embedding engines.
//! Invariants: Names exported here stay stable; `core` paths may move.

pub mod blocking;

pub use crate::core::buffer::BoundedBuffer;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Fault};
pub use crate::core::factory::{
    FileReaderFactory, FileWriterFactory, MemoryReaderFactory, MemoryWriterFactory, ReaderFactory,
    WriterFactory,
};
pub use crate::core::file::BlockingFile;
pub use crate::core::pool::{BufferLease, BufferPool, PoolOptions};
pub use crate::core::reader::{AnyReader, FileReader, MemoryReader, ReadResult, Reader, ReaderOptions};
pub use crate::core::task::{Spawner, Task, TaskHandle, ThreadSpawner};
pub use crate::core::waiter::{Waitable, Waiter, WaiterRef};
pub use crate::core::writer::{
    AnyWriter, FileWriter, MemorySink, MemoryWriter, Progress, ProgressFn, Writer, WriterOptions,
};
