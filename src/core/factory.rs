//! Purpose: Cloneable descriptors that open readers and writers against a pool.
//! Exports: `ReaderFactory`, `WriterFactory` and their file and memory variants.
//! Role: What a transfer engine holds before it commits buffers to a source or sink.
//! Invariants: Sizing hints never change over a factory's lifetime.
//! Invariants: `max_buffers == 0` at open time means `preferred_buffer_count()`.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use memmap2::Mmap;
use time::OffsetDateTime;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::file::BlockingFile;
use crate::core::pool::BufferPool;
use crate::core::reader::{AnyReader, FileReader, MemoryReader, ReaderOptions};
use crate::core::task::{Spawner, ThreadSpawner};
use crate::core::writer::{AnyWriter, FileWriter, MemorySink, MemoryWriter, WriterOptions};

fn open_error(err: io::Error, path: &Path, action: &str) -> Error {
    Error::from_io(err)
        .with_message(format!("failed to {action}"))
        .with_path(path)
}

fn file_mtime(path: &Path) -> Option<OffsetDateTime> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(OffsetDateTime::from)
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

#[derive(Clone)]
pub struct FileReaderFactory {
    path: PathBuf,
    name: String,
    spawner: Arc<dyn Spawner>,
}

impl FileReaderFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            spawner: Arc::new(ThreadSpawner),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, pool: &BufferPool, mut options: ReaderOptions) -> Result<FileReader, Error> {
        let file = File::open(&self.path).map_err(|err| open_error(err, &self.path, "open for reading"))?;
        if options.max_buffers == 0 {
            options.max_buffers = FILE_PREFERRED_BUFFERS;
        }
        debug!(path = %self.path.display(), offset = options.offset, "opening file reader");
        Ok(FileReader::new(
            self.name.clone(),
            pool,
            file,
            Arc::clone(&self.spawner),
            options,
        ))
    }
}

impl fmt::Debug for FileReaderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReaderFactory")
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryReaderFactory {
    name: String,
    data: Bytes,
    mtime: Option<OffsetDateTime>,
}

impl MemoryReaderFactory {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            mtime: None,
        }
    }

    /// Maps `path` read-only and serves it from memory.
    ///
    /// The mapping is only sound while nothing truncates the file underneath it.
    pub fn map_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| open_error(err, path, "open for mapping"))?;
        let meta = file
            .metadata()
            .map_err(|err| open_error(err, path, "stat mapped file"))?;
        let data = if meta.len() == 0 {
            Bytes::new()
        } else {
            // SAFETY: read-only mapping; callers must not truncate the file while the
            // bytes are alive.
            let map = unsafe { Mmap::map(&file) }.map_err(|err| open_error(err, path, "map file"))?;
            Bytes::from_owner(map)
        };
        Ok(Self {
            name: path.display().to_string(),
            data,
            mtime: meta.modified().ok().map(OffsetDateTime::from),
        })
    }

    pub fn with_mtime(mut self, mtime: OffsetDateTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    fn open(&self, pool: &BufferPool, options: ReaderOptions) -> MemoryReader {
        MemoryReader::new(self.name.clone(), pool, self.data.clone(), options).with_mtime(self.mtime)
    }
}

const FILE_PREFERRED_BUFFERS: usize = 4;

/// Describes a source that can be opened any number of times.
#[derive(Clone, Debug)]
pub enum ReaderFactory {
    File(FileReaderFactory),
    Memory(MemoryReaderFactory),
}

impl ReaderFactory {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileReaderFactory::new(path))
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory(MemoryReaderFactory::new(name, data))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(factory) => &factory.name,
            Self::Memory(factory) => &factory.name,
        }
    }

    pub fn open(&self, pool: &BufferPool, options: ReaderOptions) -> Result<AnyReader, Error> {
        match self {
            Self::File(factory) => factory.open(pool, options).map(AnyReader::File),
            Self::Memory(factory) => Ok(AnyReader::Memory(factory.open(pool, options))),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Self::File(factory) => file_size(&factory.path),
            Self::Memory(factory) => Some(factory.data.len() as u64),
        }
    }

    pub fn mtime(&self) -> Option<OffsetDateTime> {
        match self {
            Self::File(factory) => file_mtime(&factory.path),
            Self::Memory(factory) => factory.mtime,
        }
    }

    pub fn seekable(&self) -> bool {
        match self {
            Self::File(factory) => file_size(&factory.path).is_some(),
            Self::Memory(_) => true,
        }
    }

    /// Buffers that must be available for the reader to make any progress.
    pub fn min_buffer_usage(&self) -> usize {
        1
    }

    /// Whether providing more than `min_buffer_usage` buffers speeds things up.
    pub fn multiple_buffer_usage(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub fn preferred_buffer_count(&self) -> usize {
        match self {
            Self::File(_) => FILE_PREFERRED_BUFFERS,
            Self::Memory(_) => 1,
        }
    }
}

#[derive(Clone)]
pub struct FileWriterFactory {
    path: PathBuf,
    name: String,
    fsync: bool,
    spawner: Arc<dyn Spawner>,
}

impl FileWriterFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            fsync: false,
            spawner: Arc::new(ThreadSpawner),
        }
    }

    /// Every writer opened from this factory syncs to disk before finalize completes.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, pool: &BufferPool, mut options: WriterOptions) -> Result<FileWriter, Error> {
        let (mut file, created) = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => (file, true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .map_err(|err| open_error(err, &self.path, "open for writing"))?;
                (file, false)
            }
            Err(err) => return Err(open_error(err, &self.path, "create")),
        };

        let positioned = BlockingFile::seek(&mut file, SeekFrom::Start(options.offset))
            .and_then(|_| BlockingFile::truncate(&mut file));
        if let Err(err) = positioned {
            drop(file);
            if created {
                let _ = std::fs::remove_file(&self.path);
            }
            return Err(open_error(err, &self.path, "position for writing").with_offset(options.offset));
        }

        options.fsync |= self.fsync;
        if options.max_buffers == 0 {
            options.max_buffers = FILE_PREFERRED_BUFFERS;
        }
        debug!(path = %self.path.display(), offset = options.offset, created, "opening file writer");
        let writer = FileWriter::new(self.name.clone(), pool, file, self.spawner.as_ref(), options);
        Ok(if created {
            writer.delete_on_abandon(&self.path)
        } else {
            writer
        })
    }

    fn set_mtime(&self, mtime: OffsetDateTime) -> Result<(), Error> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|err| open_error(err, &self.path, "open for mtime"))?;
        file.set_modified(SystemTime::from(mtime))
            .map_err(|err| open_error(err, &self.path, "set mtime"))
    }
}

impl fmt::Debug for FileWriterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWriterFactory")
            .field("path", &self.path)
            .field("fsync", &self.fsync)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryWriterFactory {
    name: String,
    sink: MemorySink,
}

impl MemoryWriterFactory {
    pub fn new(name: impl Into<String>, sink: MemorySink) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }
}

/// Describes a sink that can be opened for writing.
#[derive(Clone, Debug)]
pub enum WriterFactory {
    File(FileWriterFactory),
    Memory(MemoryWriterFactory),
}

impl WriterFactory {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileWriterFactory::new(path))
    }

    pub fn memory(name: impl Into<String>, sink: MemorySink) -> Self {
        Self::Memory(MemoryWriterFactory::new(name, sink))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(factory) => &factory.name,
            Self::Memory(factory) => &factory.name,
        }
    }

    pub fn open(&self, pool: &BufferPool, options: WriterOptions) -> Result<AnyWriter, Error> {
        match self {
            Self::File(factory) => factory.open(pool, options).map(AnyWriter::File),
            Self::Memory(factory) => Ok(AnyWriter::Memory(MemoryWriter::new(
                factory.name.clone(),
                pool,
                factory.sink.clone(),
                options,
            ))),
        }
    }

    /// Current size of the sink, if it exists.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::File(factory) => file_size(&factory.path),
            Self::Memory(factory) => Some(factory.sink.len() as u64),
        }
    }

    pub fn mtime(&self) -> Option<OffsetDateTime> {
        match self {
            Self::File(factory) => file_mtime(&factory.path),
            Self::Memory(_) => None,
        }
    }

    /// Whether writing can resume at an offset into existing contents.
    pub fn offsettable(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Stamps the sink without opening a writer.
    pub fn set_mtime(&self, mtime: OffsetDateTime) -> Result<(), Error> {
        match self {
            Self::File(factory) => factory.set_mtime(mtime),
            Self::Memory(_) => Err(Error::new(ErrorKind::Usage).with_message("memory sinks carry no mtime")),
        }
    }

    pub fn min_buffer_usage(&self) -> usize {
        1
    }

    pub fn multiple_buffer_usage(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub fn preferred_buffer_count(&self) -> usize {
        match self {
            Self::File(_) => FILE_PREFERRED_BUFFERS,
            Self::Memory(_) => 1,
        }
    }
}
