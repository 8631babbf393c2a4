// Background task spawning contract plus a std-thread implementation.
use std::fmt;
use std::io;
use std::thread;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Starts cancellable, joinable background work for readers and writers.
///
/// Cancellation is cooperative: the reader or writer tells its task to quit and
/// then joins the returned handle.
pub trait Spawner: Send + Sync {
    fn spawn(&self, name: &str, task: Task) -> io::Result<TaskHandle>;
}

pub struct TaskHandle {
    join: Option<Box<dyn FnOnce() -> bool + Send>>,
}

impl TaskHandle {
    /// Wraps a blocking join function; it returns `false` if the task panicked.
    pub fn new(join: impl FnOnce() -> bool + Send + 'static) -> Self {
        Self {
            join: Some(Box::new(join)),
        }
    }

    pub fn from_thread(handle: thread::JoinHandle<()>) -> Self {
        Self::new(move || handle.join().is_ok())
    }

    /// Blocks until the task returns. Joining twice is a no-op that reports success.
    pub fn join(&mut self) -> bool {
        match self.join.take() {
            Some(join) => join(),
            None => true,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.join.is_none()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("joined", &self.is_joined())
            .finish()
    }
}

/// One named OS thread per task.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, name: &str, task: Task) -> io::Result<TaskHandle> {
        let handle = thread::Builder::new().name(name.to_string()).spawn(task)?;
        Ok(TaskHandle::from_thread(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::{Spawner, ThreadSpawner};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn thread_spawner_runs_and_joins() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut handle = ThreadSpawner
            .spawn(
                "leaseio-test",
                Box::new(move || {
                    assert_eq!(std::thread::current().name(), Some("leaseio-test"));
                    flag.store(true, Ordering::SeqCst);
                }),
            )
            .expect("spawn");
        assert!(handle.join());
        assert!(handle.is_joined());
        assert!(ran.load(Ordering::SeqCst));
        assert!(handle.join());
    }

    #[test]
    fn panicking_task_reports_failure() {
        let mut handle = ThreadSpawner
            .spawn("leaseio-panic", Box::new(|| panic!("boom")))
            .expect("spawn");
        assert!(!handle.join());
    }
}
