//! Purpose: Blocking file-handle contract used by the threaded reader and writer workers.
//! Exports: `BlockingFile` and its implementation for `std::fs::File`.
//! Role: Seam between the pipeline and the OS; tests substitute scripted handles.
//! Invariants: Calls block the calling thread; only worker threads and `close` paths use them.
//! Invariants: `truncate` cuts at the current position; `reserve` is a best-effort hint.
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use fs2::FileExt;

pub trait BlockingFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Sets the length of the file to the current position.
    fn truncate(&mut self) -> io::Result<()>;

    fn fsync(&mut self) -> io::Result<()>;

    /// Total size, or `None` when the handle has no meaningful size (pipes, sockets).
    fn size(&self) -> io::Result<Option<u64>>;

    fn modified(&self) -> Option<SystemTime> {
        None
    }

    /// Asks the filesystem to back the first `len` bytes with real blocks.
    fn reserve(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn set_modified(&mut self, _time: SystemTime) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

impl BlockingFile for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }

    fn truncate(&mut self) -> io::Result<()> {
        let pos = self.stream_position()?;
        self.set_len(pos)
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn size(&self) -> io::Result<Option<u64>> {
        let meta = self.metadata()?;
        Ok(meta.is_file().then(|| meta.len()))
    }

    fn modified(&self) -> Option<SystemTime> {
        self.metadata().and_then(|meta| meta.modified()).ok()
    }

    fn reserve(&mut self, len: u64) -> io::Result<()> {
        FileExt::allocate(self, len)
    }

    fn set_modified(&mut self, time: SystemTime) -> io::Result<()> {
        File::set_modified(self, time)
    }
}

#[cfg(test)]
mod tests {
    use super::BlockingFile;
    use std::fs::OpenOptions;
    use std::io::SeekFrom;

    #[test]
    fn std_file_truncates_at_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sink.bin");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");

        assert_eq!(BlockingFile::write(&mut file, b"0123456789").expect("write"), 10);
        assert_eq!(BlockingFile::seek(&mut file, SeekFrom::Start(4)).expect("seek"), 4);
        BlockingFile::truncate(&mut file).expect("truncate");
        assert_eq!(BlockingFile::size(&file).expect("size"), Some(4));
        assert_eq!(std::fs::read(&path).expect("read"), b"0123");
    }

    #[test]
    fn std_file_reserve_extends_to_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reserved.bin");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");

        BlockingFile::reserve(&mut file, 8192).expect("reserve");
        assert_eq!(BlockingFile::size(&file).expect("size"), Some(8192));
        assert!(BlockingFile::modified(&file).is_some());
    }
}
