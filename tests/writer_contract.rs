// Writer lifecycle tests through the public factories: cleanup policy and finalize.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use leaseio::api::{
    BufferPool, ErrorKind, FileWriterFactory, MemorySink, PoolOptions, Progress, ReaderFactory,
    ReaderOptions, WaiterRef, Writer, WriterFactory, WriterOptions, blocking,
};

fn counting() -> (WaiterRef, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let waiter: WaiterRef = Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (waiter, hits)
}

#[test]
fn abandoned_preallocation_of_existing_file_truncates_to_zero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("existing.bin");
    std::fs::write(&path, b"previous contents").expect("seed");

    let pool = BufferPool::new(PoolOptions::new(2, 4096));
    let mut writer = WriterFactory::file(&path)
        .open(&pool, WriterOptions::new())
        .expect("open");
    writer.preallocate(1_000_000).expect("preallocate");
    writer.close();

    assert_eq!(std::fs::metadata(&path).expect("kept").len(), 0);
}

#[test]
fn abandoned_partial_write_truncates_to_flushed_bytes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("partial.bin");
    std::fs::write(&path, b"").expect("seed");

    let pool = BufferPool::new(PoolOptions::new(2, 4096));
    let mut writer = WriterFactory::file(&path)
        .open(&pool, WriterOptions::new())
        .expect("open");
    writer.preallocate(50_000).expect("preallocate");

    let parker = blocking::Parker::new();
    let mut lease = pool.get_buffer(parker.waiter()).expect("buffer");
    lease.append(&[0xAB; 3000]);
    writer.add_buffer(lease, parker.waiter()).expect("add");
    while writer.written() < 3000 {
        std::thread::yield_now();
    }
    writer.close();

    let contents = std::fs::read(&path).expect("read");
    assert_eq!(contents, vec![0xAB; 3000]);
}

#[test]
fn abandoned_fresh_file_is_removed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("fresh.bin");

    let pool = BufferPool::new(PoolOptions::new(1, 4096));
    let writer = WriterFactory::file(&path)
        .open(&pool, WriterOptions::new())
        .expect("open");
    assert!(path.exists());
    drop(writer);
    assert!(!path.exists());
}

#[test]
fn finalized_empty_file_is_kept() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("empty.bin");

    let pool = BufferPool::new(PoolOptions::new(1, 4096));
    let writer = WriterFactory::file(&path)
        .open(&pool, WriterOptions::new())
        .expect("open");
    let (waiter, hits) = counting();
    assert_eq!(writer.finalize(&waiter).expect("finalize"), Progress::Ready);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    drop(writer);
    assert!(path.exists());
}

#[test]
fn finalize_with_fsync_completes_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("synced.bin");

    let pool = BufferPool::new(PoolOptions::new(1, 4096));
    let writer = WriterFactory::File(FileWriterFactory::new(&path).with_fsync(true))
        .open(&pool, WriterOptions::new())
        .expect("open");

    let parker = blocking::Parker::new();
    let mut polls = 0;
    while writer.finalize(parker.waiter()).expect("finalize") == Progress::WouldBlock {
        polls += 1;
        parker.park();
    }
    assert!(polls >= 1);
    for _ in 0..3 {
        assert_eq!(writer.finalize(parker.waiter()).expect("again"), Progress::Ready);
    }
}

#[test]
fn memory_writer_round_trips_through_memory_reader() {
    let pool = BufferPool::new(PoolOptions::new(2, 10));
    let sink = MemorySink::new();
    let writer = WriterFactory::memory("sink", sink.clone())
        .open(&pool, WriterOptions::new().with_size(26))
        .expect("open");
    blocking::write_all(&pool, &writer, b"abcdefghijklmnopqrstuvwxyz").expect("write");

    let reader = ReaderFactory::memory("sink", sink.to_bytes())
        .open(&pool, ReaderOptions::new().with_offset(20))
        .expect("open");
    assert_eq!(blocking::read_to_end(&reader).expect("read"), b"uvwxyz");
}

#[test]
fn declared_size_rejects_extra_bytes() {
    let pool = BufferPool::new(PoolOptions::new(2, 10));
    let writer = WriterFactory::memory("sink", MemorySink::new())
        .open(&pool, WriterOptions::new().with_size(5))
        .expect("open");
    let err = blocking::write_all(&pool, &writer, b"too many bytes").expect_err("overflow");
    assert_eq!(err.kind(), ErrorKind::Overflow);
}
