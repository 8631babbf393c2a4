// Threaded reader: a worker fills pool buffers from a blocking file ahead of the consumer.
use std::fmt;
use std::io::{self, SeekFrom};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

use super::{ReadResult, Reader, ReaderOptions, ReaderState};
use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::file::BlockingFile;
use crate::core::pool::{BufferLease, BufferPool};
use crate::core::task::{Spawner, TaskHandle};
use crate::core::waiter::{Waitable, Waiter, WaiterRef};
use crate::core::window::SeekPlan;

struct ReaderShared {
    name: String,
    pool: BufferPool,
    max_buffers: usize,
    state: Mutex<ReaderState>,
    cond: Condvar,
    waitable: Waitable,
    file: Mutex<Box<dyn BlockingFile>>,
}

/// Pool-side waiter for the worker. Taking the state lock before notifying means the
/// wakeup cannot slip in between the worker's failed lease attempt and its wait.
struct WorkerWake(Weak<ReaderShared>);

impl Waiter for WorkerWake {
    fn wake(&self) {
        if let Some(shared) = self.0.upgrade() {
            let _state = shared.state.lock();
            shared.cond.notify_all();
        }
    }
}

enum Fill {
    Filled,
    Eof,
    Stopped,
    Failed(Error),
}

pub struct FileReader {
    shared: Arc<ReaderShared>,
    waker: WaiterRef,
    spawner: Arc<dyn Spawner>,
    task: Option<TaskHandle>,
    seekable: bool,
    mtime: Option<OffsetDateTime>,
}

impl FileReader {
    /// Wraps `file` and starts reading at `options.offset` right away.
    ///
    /// Construction never fails outright: an invalid pool or a bad initial window
    /// leaves the reader faulted and the first `get_buffer` reports it.
    pub fn new(
        name: impl Into<String>,
        pool: &BufferPool,
        file: impl BlockingFile + 'static,
        spawner: Arc<dyn Spawner>,
        options: ReaderOptions,
    ) -> Self {
        let name = name.into();
        let max_size = match file.size() {
            Ok(size) => size,
            Err(err) => {
                debug!(reader = %name, error = %err, "size unavailable; treating as stream");
                None
            }
        };
        let mtime = file.modified().map(OffsetDateTime::from);
        let max_buffers = if options.max_buffers == 0 {
            super::DEFAULT_MAX_BUFFERS
        } else {
            options.max_buffers
        };

        let shared = Arc::new(ReaderShared {
            name,
            pool: pool.clone(),
            max_buffers,
            state: Mutex::new(ReaderState::new(max_size)),
            cond: Condvar::new(),
            waitable: Waitable::new(),
            file: Mutex::new(Box::new(file)),
        });
        let waker: WaiterRef = Arc::new(WorkerWake(Arc::downgrade(&shared)));
        let mut reader = Self {
            shared,
            waker,
            spawner,
            task: None,
            seekable: max_size.is_some(),
            mtime,
        };

        if !pool.is_valid() {
            let fault = Fault::new(ErrorKind::Alloc, "buffer pool is invalid");
            reader.shared.state.lock().fault = Some(fault);
        } else if let Err(err) = reader.seek(options.offset, options.size) {
            debug!(reader = %reader.shared.name, error = %err, "initial positioning failed");
        }
        reader
    }

    fn start_worker(&mut self) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        let waker = Arc::clone(&self.waker);
        match self
            .spawner
            .spawn("leaseio-reader", Box::new(move || read_loop(&shared, &waker)))
        {
            Ok(task) => {
                self.task = Some(task);
                Ok(())
            }
            Err(err) => {
                let err = Error::new(ErrorKind::Spawn)
                    .with_message("failed to start reader worker")
                    .with_source(err);
                Err(self.shared.state.lock().fail(err))
            }
        }
    }

    fn stop_worker(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        self.shared.state.lock().quit = true;
        self.shared.cond.notify_all();
        if !task.join() {
            warn!(reader = %self.shared.name, "reader worker panicked");
        }
    }

    fn position_file(&self, start: u64) -> Result<(), Error> {
        let landed = self.shared.file.lock().seek(SeekFrom::Start(start));
        match landed {
            Ok(pos) if pos == start => Ok(()),
            Ok(pos) => Err(Error::new(ErrorKind::Io)
                .with_message(format!("seek landed at {pos}"))
                .with_offset(start)),
            Err(err) => Err(Error::from_io(err)
                .with_message("seek failed")
                .with_offset(start)),
        }
    }
}

impl Reader for FileReader {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn seekable(&self) -> bool {
        self.seekable
    }

    fn size(&self) -> Option<u64> {
        self.shared.state.lock().window.size()
    }

    fn mtime(&self) -> Option<OffsetDateTime> {
        self.mtime
    }

    fn get_buffer(&self, waiter: &WaiterRef) -> Result<ReadResult, Error> {
        let mut state = self.shared.state.lock();
        state.check_usable()?;
        if let Some(lease) = state.queue.pop_front() {
            if state.queue.len() + 1 == self.shared.max_buffers {
                self.shared.cond.notify_all();
            }
            state.delivered = true;
            return Ok(ReadResult::Buffer(lease));
        }
        if state.eof {
            return Ok(ReadResult::Eof);
        }
        self.shared.waitable.add_waiter(waiter);
        Ok(ReadResult::WouldBlock)
    }

    fn seek(&mut self, offset: u64, size: Option<u64>) -> Result<(), Error> {
        let plan = self.shared.state.lock().plan_seek(offset, size, self.seekable)?;
        let window = match plan {
            SeekPlan::Unchanged => return Ok(()),
            SeekPlan::Reset(window) => window,
        };

        self.stop_worker();
        self.shared.pool.remove_waiter(&self.waker);
        self.shared.waitable.remove_waiters();

        let (discarded, exhausted) = {
            let mut state = self.shared.state.lock();
            state.quit = false;
            let discarded = state.reset(window);
            (discarded, state.eof)
        };
        drop(discarded);
        debug!(
            reader = %self.shared.name,
            offset,
            size = ?window.size(),
            "positioned"
        );

        if self.seekable {
            if let Err(err) = self.position_file(offset) {
                return Err(self.shared.state.lock().fail(err));
            }
        }
        if exhausted {
            return Ok(());
        }
        self.start_worker()
    }

    fn rewind(&mut self) -> Result<(), Error> {
        let (offset, size) = {
            let state = self.shared.state.lock();
            state.check_usable()?;
            state.origin()?
        };
        self.seek(offset, size)
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        self.shared.waitable.remove_waiter(waiter);
    }

    fn close(&mut self) {
        if self.shared.state.lock().closed {
            return;
        }
        self.stop_worker();
        self.shared.pool.remove_waiter(&self.waker);
        self.shared.waitable.remove_waiters();
        let discarded = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        drop(discarded);
        debug!(reader = %self.shared.name, "closed");
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("name", &self.shared.name)
            .field("seekable", &self.seekable)
            .field("max_buffers", &self.shared.max_buffers)
            .finish()
    }
}

fn read_loop(shared: &ReaderShared, waker: &WaiterRef) {
    trace!(reader = %shared.name, "worker started");
    let mut state = shared.state.lock();
    loop {
        if state.quit || state.eof || state.fault.is_some() {
            break;
        }
        if state.queue.len() >= shared.max_buffers {
            shared.cond.wait(&mut state);
            continue;
        }
        let Some(mut lease) = shared.pool.get_buffer(waker) else {
            shared.cond.wait(&mut state);
            continue;
        };

        let fill = fill_buffer(shared, &mut state, &mut lease);
        match fill {
            Fill::Stopped => {
                MutexGuard::unlocked(&mut state, || drop(lease));
                break;
            }
            Fill::Failed(err) => {
                debug!(reader = %shared.name, error = %err, "read failed");
                state.fail(err);
            }
            Fill::Eof => state.eof = true,
            Fill::Filled => {}
        }

        let mut signal = false;
        if state.fault.is_none() && !lease.is_empty() {
            trace!(reader = %shared.name, len = lease.len(), "buffer ready");
            state.queue.push_back(lease);
            signal = state.queue.len() == 1;
        } else {
            MutexGuard::unlocked(&mut state, || drop(lease));
        }
        let finished = state.eof || state.fault.is_some();
        if signal || finished {
            shared.waitable.signal_availability();
        }
        if finished {
            break;
        }
    }
    drop(state);
    trace!(reader = %shared.name, "worker stopped");
}

/// Reads into `lease` until it is full or the window ends. The state lock is released
/// around every blocking read.
fn fill_buffer(
    shared: &ReaderShared,
    state: &mut MutexGuard<'_, ReaderState>,
    lease: &mut BufferLease,
) -> Fill {
    loop {
        if lease.is_full() {
            return Fill::Filled;
        }
        let want = state.window.want(lease.spare_capacity());
        if want == 0 {
            return Fill::Eof;
        }
        let result = MutexGuard::unlocked(state, || shared.file.lock().read(lease.spare_mut(want)));
        if state.quit {
            return Fill::Stopped;
        }
        match result {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Fill::Failed(Error::from_io(err).with_message("read failed")),
            Ok(0) => {
                return match state.window.remaining() {
                    Some(remaining) if remaining > 0 => Fill::Failed(
                        Error::new(ErrorKind::ShortRead)
                            .with_message(format!("source ended with {remaining} bytes missing")),
                    ),
                    _ => Fill::Eof,
                };
            }
            Ok(n) => {
                lease.commit(n);
                if let Err(err) = state.window.advance(n as u64) {
                    return Fill::Failed(err);
                }
                if state.window.is_exhausted() {
                    return Fill::Eof;
                }
            }
        }
    }
}
