//! Purpose: Single-shot park-and-notify protocol shared by pools, readers and writers.
//! Exports: `Waiter`, `WaiterRef`, `Waitable`.
//! Role: Replaces polling; a caller that got "would block" parks a waiter and is woken once.
//! Invariants: A parked waiter is notified at most once per parking and never held twice.
//! Invariants: Removal never races an in-flight callback; it waits on a condvar until it ends.
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Receives availability notifications.
///
/// `wake` runs on an unspecified thread, possibly while the notifying object holds
/// internal locks. It must not block and must not call back into the pool, reader
/// or writer that woke it; post a wakeup to the owning execution context instead.
pub trait Waiter: Send + Sync {
    fn wake(&self);
}

impl<F> Waiter for F
where
    F: Fn() + Send + Sync,
{
    fn wake(&self) {
        self()
    }
}

pub type WaiterRef = Arc<dyn Waiter>;

fn same_waiter(a: &WaiterRef, b: &WaiterRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Default)]
struct WaitList {
    parked: Vec<WaiterRef>,
    signalling: Option<WaiterRef>,
}

#[derive(Default)]
pub struct Waitable {
    list: Mutex<WaitList>,
    idle: Condvar,
}

impl Waitable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_waiter(&self, waiter: &WaiterRef) {
        let mut list = self.list.lock();
        if list.parked.iter().any(|parked| same_waiter(parked, waiter)) {
            return;
        }
        list.parked.push(Arc::clone(waiter));
    }

    /// Unparks `waiter`, first waiting out a callback to it that is in progress.
    pub fn remove_waiter(&self, waiter: &WaiterRef) {
        let mut list = self.list.lock();
        while list
            .signalling
            .as_ref()
            .is_some_and(|active| same_waiter(active, waiter))
        {
            self.idle.wait(&mut list);
        }
        list.parked.retain(|parked| !same_waiter(parked, waiter));
    }

    pub fn remove_waiters(&self) {
        let mut list = self.list.lock();
        while list.signalling.is_some() {
            self.idle.wait(&mut list);
        }
        list.parked.clear();
    }

    /// Notifies one parked waiter. Returns whether anybody was woken.
    pub fn signal_availability(&self) -> bool {
        let mut list = self.list.lock();
        // Concurrent signallers serialize here so that `signalling` names a single
        // callback and `remove_waiter` can wait for exactly that one.
        while list.signalling.is_some() {
            self.idle.wait(&mut list);
        }
        let Some(waiter) = list.parked.pop() else {
            return false;
        };
        list.signalling = Some(Arc::clone(&waiter));
        drop(list);

        waiter.wake();

        let mut list = self.list.lock();
        list.signalling = None;
        drop(list);
        self.idle.notify_all();
        true
    }

    pub fn parked(&self) -> usize {
        self.list.lock().parked.len()
    }
}

impl fmt::Debug for Waitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.list.lock();
        f.debug_struct("Waitable")
            .field("parked", &list.parked.len())
            .field("signalling", &list.signalling.is_some())
            .finish()
    }
}
