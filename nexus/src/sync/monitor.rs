use std::{
    mem::ManuallyDrop,
    num::NonZeroU64,
    ops::Deref,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

use crate::{nexus::ThreadNexus, threading::Thread, VirtualMachine};

fn get_thread_id() -> NonZeroU64 {
    thread_local! {
        static KEY: u64 = 0;
    }
    KEY.with(|x| {
        NonZeroU64::new(x as *const _ as u64).expect("thread-local variable address is null")
    })
}

/// Heavy lock and condition variable built from `parking_lot`'s `Mutex` and `Condvar`.
///
/// It behaves like a re-entrant mutex combined with a condition variable, except:
/// <ul>
/// <li>Re-entry is tracked by the holding native thread, so a visitor running under the
///     registry lock may call back into registry queries.</li>
/// <li>`lock_with_handshake` lets a managed thread block without stalling a thread that
///     is stopping the world.</li>
/// <li>It can be forcibly reset in a freshly forked child, where the thread that held it
///     no longer exists.</li>
/// <li>It does not provide mutable access to the protected data as it is unsound with
///     re-entry, instead use `RefCell` to mutate the protected data.</li>
/// </ul>
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cvar: Condvar,
    rec_count: AtomicUsize,
    holder: AtomicU64,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            cvar: Condvar::new(),
            rec_count: AtomicUsize::new(0),
            holder: AtomicU64::new(0),
        }
    }

    fn held_by_me(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == get_thread_id().get()
    }

    fn reentrant_guard(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            monitor: self,
            guard: unsafe { ManuallyDrop::new(self.mutex.make_guard_unchecked()) },
        }
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        let guard = if !self.held_by_me() {
            let guard = self.mutex.lock();
            self.holder.store(get_thread_id().get(), Ordering::Release);
            MonitorGuard {
                monitor: self,
                guard: ManuallyDrop::new(guard),
            }
        } else {
            self.reentrant_guard()
        };
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        guard
    }

    /// Lock the monitor on behalf of `thread`, which is in the managed phase.
    ///
    /// The thread is declared unmanaged while it blocks and re-enters the managed
    /// phase before this returns. If re-entering would block (someone holds the
    /// process-critical lock) the monitor is dropped first so the holder can make
    /// progress, and the whole sequence is retried. A pending halt does not gate the
    /// return: the thread was managed when it called.
    pub fn lock_with_handshake<VM: VirtualMachine>(
        &self,
        nexus: &ThreadNexus<VM>,
        thread: &Thread<VM>,
    ) -> MonitorGuard<'_, T> {
        let guard = if !self.held_by_me() {
            let guard = loop {
                nexus.enter_unmanaged(thread);
                let guard = self.mutex.lock();
                if nexus.try_restore_managed(thread) {
                    break guard;
                } else {
                    drop(guard);
                    nexus.restore_managed(thread);
                }
            };
            self.holder.store(get_thread_id().get(), Ordering::Release);
            MonitorGuard {
                monitor: self,
                guard: ManuallyDrop::new(guard),
            }
        } else {
            self.reentrant_guard()
        };
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        guard
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    /// Return the monitor to the unlocked state regardless of who holds it.
    ///
    /// # Safety
    ///
    /// Only sound in a forked child before any other thread exists: the holder must be a
    /// thread that did not survive the fork, and no guard for this monitor may be alive
    /// on the calling thread.
    pub unsafe fn reset_after_fork(&self) {
        if self.mutex.is_locked() {
            unsafe { self.mutex.force_unlock() };
        }
        self.rec_count.store(0, Ordering::Relaxed);
        self.holder.store(0, Ordering::Relaxed);
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Wait on the monitor's condition variable for at most `timeout`.
    ///
    /// Re-entrant holds are suspended for the duration of the wait and restored afterwards.
    pub fn wait_for_no_handshake(&mut self, timeout: Duration) -> WaitTimeoutResult {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        let holder = self.monitor.holder.swap(0, Ordering::Relaxed);
        let result = self.monitor.cvar.wait_for(&mut self.guard, timeout);
        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Relaxed);
        result
    }

    pub fn notify_all(&self) {
        self.monitor.cvar.notify_all();
    }
}

impl<'a, T> Drop for MonitorGuard<'a, T> {
    fn drop(&mut self) {
        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(0, Ordering::Relaxed);
            unsafe { ManuallyDrop::drop(&mut self.guard) };
        }
    }
}
