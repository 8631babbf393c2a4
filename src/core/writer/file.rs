// Threaded writer: a worker drains queued leases into a blocking file.
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex, MutexGuard};
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

use super::{Progress, ProgressFn, Writer, WriterOptions, WriterState, foreign_lease};
use crate::core::error::{Error, ErrorKind, Fault};
use crate::core::file::BlockingFile;
use crate::core::pool::{BufferLease, BufferPool};
use crate::core::task::{Spawner, TaskHandle};
use crate::core::waiter::{Waitable, WaiterRef};

struct WriterShared {
    name: String,
    pool: BufferPool,
    max_buffers: usize,
    fsync: bool,
    progress: Option<ProgressFn>,
    state: Mutex<WriterState>,
    cond: Condvar,
    waitable: Waitable,
    file: Mutex<Option<Box<dyn BlockingFile>>>,
}

struct Flushed {
    written: u64,
    error: Option<Error>,
}

pub struct FileWriter {
    shared: Arc<WriterShared>,
    task: Option<TaskHandle>,
    start: u64,
    limit: Option<u64>,
    delete_on_abandon: Option<PathBuf>,
}

impl FileWriter {
    /// Wraps `file`, already positioned at `options.offset`, and starts the flush worker.
    ///
    /// Spawn failure or an invalid pool leaves the writer faulted.
    pub fn new(
        name: impl Into<String>,
        pool: &BufferPool,
        file: impl BlockingFile + 'static,
        spawner: &dyn Spawner,
        options: WriterOptions,
    ) -> Self {
        let shared = Arc::new(WriterShared {
            name: name.into(),
            pool: pool.clone(),
            max_buffers: options.effective_max_buffers(),
            fsync: options.fsync,
            progress: options.progress.clone(),
            state: Mutex::new(WriterState::default()),
            cond: Condvar::new(),
            waitable: Waitable::new(),
            file: Mutex::new(Some(Box::new(file))),
        });

        let task = if pool.is_valid() {
            let worker = Arc::clone(&shared);
            match spawner.spawn("leaseio-writer", Box::new(move || write_loop(&worker))) {
                Ok(task) => Some(task),
                Err(err) => {
                    debug!(writer = %shared.name, error = %err, "failed to start writer worker");
                    shared.state.lock().fault = Some(Fault::new(
                        ErrorKind::Spawn,
                        format!("failed to start writer worker: {err}"),
                    ));
                    None
                }
            }
        } else {
            shared.state.lock().fault = Some(Fault::new(ErrorKind::Alloc, "buffer pool is invalid"));
            None
        };

        Self {
            shared,
            task,
            start: options.offset,
            limit: options.size,
            delete_on_abandon: None,
        }
    }

    /// Arms deletion of `path` when the writer is abandoned before anything was written.
    /// Used when the file did not exist before this writer created it.
    pub fn delete_on_abandon(mut self, path: impl Into<PathBuf>) -> Self {
        self.delete_on_abandon = Some(path.into());
        self
    }

    fn stop_worker(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        self.shared.state.lock().quit = true;
        self.shared.cond.notify_all();
        if !task.join() {
            warn!(writer = %self.shared.name, "writer worker panicked");
        }
    }

    fn apply_close_policy(&self, finalized: bool, written: u64, preallocated: bool) {
        let file = self.shared.file.lock().take();
        if finalized {
            return;
        }
        if written == 0 {
            if let Some(path) = &self.delete_on_abandon {
                drop(file);
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(writer = %self.shared.name, path = %path.display(), "removed abandoned file"),
                    Err(err) => warn!(writer = %self.shared.name, path = %path.display(), error = %err, "failed to remove abandoned file"),
                }
                return;
            }
        }
        if preallocated {
            let Some(mut file) = file else {
                return;
            };
            let end = self.start + written;
            let result = file
                .seek(SeekFrom::Start(end))
                .and_then(|_| file.truncate());
            match result {
                Ok(()) => debug!(writer = %self.shared.name, len = end, "truncated preallocated file"),
                Err(err) => warn!(writer = %self.shared.name, error = %err, "failed to truncate preallocated file"),
            }
        }
    }
}

impl Writer for FileWriter {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn add_buffer(&self, lease: BufferLease, waiter: &WaiterRef) -> Result<Progress, Error> {
        if !self.shared.pool.owns(&lease) {
            return Err(foreign_lease());
        }
        // `lease` is a parameter, so every early return drops it after the guard.
        let mut state = self.shared.state.lock();
        state.admit(lease.len() as u64, self.limit)?;
        if lease.is_empty() {
            return Ok(Progress::Ready);
        }
        state.queue.push_back(lease);
        if state.queue.len() == 1 {
            self.shared.cond.notify_all();
        }
        if state.held() > self.shared.max_buffers {
            self.shared.waitable.add_waiter(waiter);
            return Ok(Progress::WouldBlock);
        }
        Ok(Progress::Ready)
    }

    fn finalize(&self, waiter: &WaiterRef) -> Result<Progress, Error> {
        let mut state = self.shared.state.lock();
        if state.finalized && !state.closed {
            return Ok(Progress::Ready);
        }
        state.check_usable()?;
        if !state.finalizing {
            state.finalizing = true;
            if !self.shared.fsync && state.held() == 0 {
                state.finalized = true;
                self.shared.cond.notify_all();
                debug!(writer = %self.shared.name, written = state.written, "finalized");
                return Ok(Progress::Ready);
            }
            self.shared.cond.notify_all();
        }
        self.shared.waitable.add_waiter(waiter);
        Ok(Progress::WouldBlock)
    }

    fn preallocate(&mut self, size: u64) -> Result<(), Error> {
        self.shared.state.lock().check_preallocate()?;
        let result = {
            let mut guard = self.shared.file.lock();
            match guard.as_mut() {
                Some(file) => extend(file.as_mut(), size),
                None => Err(Error::new(ErrorKind::Closed).with_message("writer is closed")),
            }
        };
        let mut state = self.shared.state.lock();
        match result {
            Ok(()) => {
                state.preallocated = true;
                debug!(writer = %self.shared.name, size, "preallocated");
                Ok(())
            }
            Err(err) => Err(state.fail(err)),
        }
    }

    fn set_mtime(&mut self, mtime: OffsetDateTime) -> Result<(), Error> {
        {
            let state = self.shared.state.lock();
            state.check_usable()?;
            if !state.finalized {
                return Err(Error::new(ErrorKind::Usage).with_message("mtime can only be set after finalize"));
            }
        }
        let mut guard = self.shared.file.lock();
        let Some(file) = guard.as_mut() else {
            return Err(Error::new(ErrorKind::Closed).with_message("writer is closed"));
        };
        file.set_modified(SystemTime::from(mtime))
            .map_err(|err| Error::from_io(err).with_message("failed to set mtime"))
    }

    fn written(&self) -> u64 {
        self.shared.state.lock().written
    }

    fn remove_waiter(&self, waiter: &WaiterRef) {
        self.shared.waitable.remove_waiter(waiter);
    }

    fn close(&mut self) {
        if self.shared.state.lock().closed {
            return;
        }
        self.stop_worker();
        self.shared.waitable.remove_waiters();
        let (discarded, finalized, written, preallocated) = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.queue),
                state.finalized,
                state.written,
                state.preallocated,
            )
        };
        drop(discarded);
        self.apply_close_policy(finalized, written, preallocated);
        debug!(writer = %self.shared.name, written, finalized, "closed");
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWriter")
            .field("name", &self.shared.name)
            .field("start", &self.start)
            .field("max_buffers", &self.shared.max_buffers)
            .field("fsync", &self.shared.fsync)
            .finish()
    }
}

/// Grows the file by `size` past the current position, then returns to it.
fn extend(file: &mut dyn BlockingFile, size: u64) -> Result<(), Error> {
    let here = file
        .seek(SeekFrom::Current(0))
        .map_err(|err| Error::from_io(err).with_message("failed to query write position"))?;
    let target = here.checked_add(size).ok_or_else(|| {
        Error::new(ErrorKind::Overflow)
            .with_message("preallocation end overflows")
            .with_offset(here)
    })?;
    file.seek(SeekFrom::Start(target))
        .and_then(|_| file.truncate())
        .map_err(|err| {
            Error::from_io(err)
                .with_message("failed to extend file")
                .with_offset(target)
        })?;
    if let Err(err) = file.reserve(target) {
        debug!(error = %err, "block reservation unavailable");
    }
    file.seek(SeekFrom::Start(here))
        .map_err(|err| Error::from_io(err).with_message("failed to seek back").with_offset(here))?;
    Ok(())
}

fn write_loop(shared: &WriterShared) {
    trace!(writer = %shared.name, "worker started");
    let mut state = shared.state.lock();
    loop {
        if state.quit || state.finalized || state.fault.is_some() {
            break;
        }
        let Some(lease) = state.queue.pop_front() else {
            if state.finalizing {
                finish(shared, &mut state);
                break;
            }
            shared.cond.wait(&mut state);
            continue;
        };

        state.in_flight = true;
        let flushed = MutexGuard::unlocked(&mut state, move || {
            let flushed = write_lease(shared, &lease);
            drop(lease);
            flushed
        });
        let held_before = state.held();
        state.in_flight = false;
        state.written += flushed.written;
        trace!(writer = %shared.name, len = flushed.written, "buffer flushed");

        if let Some(err) = flushed.error {
            debug!(writer = %shared.name, written = state.written, error = %err, "write failed");
            state.fail(err);
            shared.waitable.signal_availability();
            break;
        }
        if held_before > shared.max_buffers {
            shared.waitable.signal_availability();
        }
    }
    drop(state);
    trace!(writer = %shared.name, "worker stopped");
}

/// Queue drained while finalizing: sync once if asked, then report completion.
fn finish(shared: &WriterShared, state: &mut MutexGuard<'_, WriterState>) {
    if shared.fsync {
        let synced = MutexGuard::unlocked(state, || match shared.file.lock().as_mut() {
            Some(file) => file.fsync(),
            None => Ok(()),
        });
        if let Err(err) = synced {
            let err = Error::from_io(err).with_message("fsync failed");
            debug!(writer = %shared.name, error = %err, "finalize failed");
            state.fail(err);
            shared.waitable.signal_availability();
            return;
        }
    }
    state.finalized = true;
    debug!(writer = %shared.name, written = state.written, "finalized");
    shared.waitable.signal_availability();
}

fn write_lease(shared: &WriterShared, lease: &BufferLease) -> Flushed {
    let mut guard = shared.file.lock();
    let Some(file) = guard.as_mut() else {
        return Flushed {
            written: 0,
            error: Some(Error::new(ErrorKind::Closed).with_message("writer is closed")),
        };
    };
    let mut data = lease.as_slice();
    let mut written = 0u64;
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => {
                return Flushed {
                    written,
                    error: Some(
                        Error::new(ErrorKind::ShortWrite)
                            .with_message(format!("sink accepted no bytes with {} pending", data.len())),
                    ),
                };
            }
            Ok(n) => {
                data = &data[n..];
                written += n as u64;
                if let Some(progress) = &shared.progress {
                    progress(n as u64);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Flushed {
                    written,
                    error: Some(Error::from_io(err).with_message("write failed")),
                };
            }
        }
    }
    Flushed {
        written,
        error: None,
    }
}
