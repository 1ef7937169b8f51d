//! Recovery of the nexus in a forked child.
//!
//! Only the forking native thread survives `fork(2)`. Every other registered thread
//! is abandoned: language threads are marked stopped, fibers are marked dead and
//! runtime helpers are discarded. Locks that a dead thread may have held are reset.

use std::sync::{atomic::Ordering, Arc};

use parking_lot::lock_api::RawMutex as _;

use super::ThreadNexus;
use crate::{
    threading::{Execution, Fiber, LanguageThread, Thread, ThreadPhase},
    VirtualMachine,
};

impl<VM: VirtualMachine> ThreadNexus<VM> {
    /// Rebuild the registry around `current`, the only thread alive after a fork.
    ///
    /// # Safety
    ///
    /// Must be called in the child of a `fork(2)` by the native thread that forked,
    /// before any other thread is started, and with no registry guard alive.
    pub unsafe fn recover_after_fork(&self, current: &Arc<Thread<VM>>) {
        unsafe {
            self.threads.reset_after_fork();
            self.waiters.reset_after_fork();
        }

        let threads = self.threads.lock_no_handshake();
        let previous = std::mem::take(&mut threads.borrow_mut().threads);
        let mut abandoned = 0usize;

        for entry in previous.into_iter().rev() {
            let Some(thread) = entry.upgrade() else {
                continue;
            };

            if Arc::ptr_eq(&thread, current) {
                thread.with_execution(|execution| {
                    if let Execution::Thread(Some(handle)) = execution {
                        handle.relink_current();
                    }
                });
                continue;
            }

            self.abandon(&thread);
            abandoned += 1;
        }

        threads.borrow_mut().threads.push(Arc::downgrade(current));
        drop(threads);

        self.reset_lock_state(current);
        VM::set_root_thread(current);
        log::info!(
            "thread nexus: recovered after fork in {}, abandoned {} threads",
            current.name(),
            abandoned
        );
    }

    fn abandon(&self, thread: &Thread<VM>) {
        let discarded = thread.with_execution(|execution| match execution {
            Execution::Thread(handle) => {
                if let Some(handle) = handle {
                    handle.mark_stopped();
                }
                false
            }
            Execution::Fiber(fiber) => {
                if let Some(fiber) = fiber {
                    fiber.mark_dead();
                    thread.set_canceled();
                }
                false
            }
            Execution::System => true,
        });

        if discarded {
            thread.set_discarded();
            self.threads_destroyed.fetch_add(1, Ordering::Relaxed);
        } else {
            thread.set_zombie();
        }
        thread.set_phase(ThreadPhase::Unmanaged);
        log::trace!("thread nexus: abandoned {} after fork", thread.name());
    }

    fn reset_lock_state(&self, current: &Thread<VM>) {
        let owner = self.lock.load(Ordering::Acquire);
        if owner != 0 && owner != current.id() {
            log::warn!("thread nexus: process-critical lock held by dead thread {owner}, clearing");
            self.lock.store(0, Ordering::Release);
        }

        let halt = self.halt.load(Ordering::Acquire);
        if halt != 0 && halt != current.id() {
            log::warn!("thread nexus: halt requested by dead thread {halt}, clearing");
            self.halt.store(0, Ordering::Release);
            if self.halting.is_locked() {
                unsafe { self.halting.unlock() };
            }
        }
    }

    /// Fork the process with the world stopped.
    ///
    /// `current` must be the identity published on the calling thread. Returns the
    /// child's pid in the parent and `None` in the child, whose nexus has already been
    /// recovered.
    pub fn fork(&self, current: &Arc<Thread<VM>>) -> Result<Option<libc::pid_t>, errno::Errno> {
        let acquired = !self.lock_owned(current);
        self.stop_the_world(current);

        let threads = self.threads.lock_no_handshake();
        let pid = unsafe { libc::fork() };
        let result = match pid {
            -1 => {
                drop(threads);
                Err(errno::errno())
            }
            0 => {
                std::mem::forget(threads);
                unsafe { self.recover_after_fork(current) };
                Ok(None)
            }
            pid => {
                drop(threads);
                Ok(Some(pid))
            }
        };

        if acquired {
            self.release_lock(current);
        }
        result
    }
}
