//! The thread nexus: registry of execution units and the safepoint protocol.
//!
//! A single process-critical lock (the "token", holding the id of its owner) serializes
//! phase transitions into [`ThreadPhase::Managed`]. A thread that owns the token can
//! stop the world: once every other registered thread is observed in a yielding phase,
//! none of them can become managed again until the token is released.
//!
//! Separately, a thread may request a permanent halt. From then on any other thread that
//! tries to become managed blocks forever.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{lock_api::RawMutex as _, RawMutex};

use crate::{
    error::FatalError,
    options::{Options, OPTIONS},
    sync::{Monitor, MonitorGuard},
    threading::{Execution, Thread, ThreadKind, ThreadPhase},
    VirtualMachine,
};

pub mod backoff;
#[cfg(unix)]
pub mod fork;

use backoff::Backoff;

pub(crate) struct ThreadList<VM: VirtualMachine> {
    threads: Vec<Weak<Thread<VM>>>,
    last_id: u32,
}

impl<VM: VirtualMachine> ThreadList<VM> {
    fn live(&self) -> impl Iterator<Item = Arc<Thread<VM>>> + '_ {
        self.threads.iter().filter_map(Weak::upgrade)
    }

    fn prune(&mut self) {
        self.threads.retain(|thread| thread.strong_count() > 0);
    }
}

pub struct ThreadNexus<VM: VirtualMachine> {
    threads: Monitor<RefCell<ThreadList<VM>>>,
    /// Id of the thread holding the process-critical lock, 0 when unlocked.
    lock: AtomicU32,
    /// Id of the halting thread, 0 when no halt was requested.
    halt: AtomicU32,
    /// Acquired by the halting thread and never released.
    halting: RawMutex,
    /// Threads waiting for the process-critical lock park here.
    waiters: Monitor<()>,
    options: Options,
    threads_created: AtomicU64,
    threads_destroyed: AtomicU64,
}

impl<VM: VirtualMachine> Default for ThreadNexus<VM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<VM: VirtualMachine> ThreadNexus<VM> {
    /// Create a nexus configured from the process-wide [`OPTIONS`].
    pub fn new() -> Self {
        Self::with_options(OPTIONS.clone())
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            threads: Monitor::new(RefCell::new(ThreadList {
                threads: Vec::new(),
                last_id: 0,
            })),
            lock: AtomicU32::new(0),
            halt: AtomicU32::new(0),
            halting: RawMutex::INIT,
            waiters: Monitor::new(()),
            options,
            threads_created: AtomicU64::new(0),
            threads_destroyed: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Lock the registry from whatever thread is calling.
    ///
    /// A managed thread that does not own the token hands its phase over while it
    /// blocks, so that a concurrent stopper holding the registry can converge.
    fn lock_threads(&self) -> MonitorGuard<'_, RefCell<ThreadList<VM>>> {
        match Thread::<VM>::current() {
            Some(thread) if thread.phase() == ThreadPhase::Managed && !self.lock_owned(&thread) => {
                self.threads.lock_with_handshake(self, &thread)
            }
            _ => self.threads.lock_no_handshake(),
        }
    }

    /* Halting */

    /// Make `thread` the halting thread. Every other thread that later tries to enter
    /// the managed phase blocks forever.
    pub fn request_halt(&self, thread: &Thread<VM>) {
        if !self.halting.try_lock() {
            VM::fatal(FatalError::protocol_misuse(
                thread.id(),
                "halting mutex is already locked",
            ));
        }
        self.halt.store(thread.id(), Ordering::Release);
        log::info!("thread nexus: halt requested by {}", thread.name());
    }

    pub fn halting_thread(&self) -> Option<u32> {
        match self.halt.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn halted_for(&self, thread: &Thread<VM>) -> bool {
        let halt = self.halt.load(Ordering::Acquire);
        halt != 0 && halt != thread.id()
    }

    fn wait_for_halt(&self, thread: &Thread<VM>) {
        if !self.halted_for(thread) {
            return;
        }

        if thread.phase() == ThreadPhase::Managed && !self.lock_owned(thread) {
            thread.set_phase(ThreadPhase::Waiting);
        }
        log::debug!("{}: blocking on halt", thread.name());

        self.halting.lock();
        // Only reachable when the halt was cleared by fork recovery.
        unsafe { self.halting.unlock() };
    }

    /* Phase transitions */

    /// Enter [`ThreadPhase::Managed`], waiting for the process-critical lock unless
    /// `thread` already owns it.
    pub fn enter_managed(&self, thread: &Thread<VM>) {
        self.wait_for_halt(thread);
        self.restore_managed(thread);
    }

    /// Enter [`ThreadPhase::Managed`] only if it can be done without blocking.
    pub fn try_enter_managed(&self, thread: &Thread<VM>) -> bool {
        if self.halted_for(thread) {
            return false;
        }
        self.try_restore_managed(thread)
    }

    /// Return to the managed phase through the token alone, ignoring a pending halt.
    ///
    /// Only for threads that were managed a moment ago and stepped aside to block
    /// on a nexus-internal lock.
    pub(crate) fn restore_managed(&self, thread: &Thread<VM>) {
        if self.lock_owned(thread) {
            thread.set_phase(ThreadPhase::Managed);
        } else {
            self.acquire_lock_or_wait(thread);
            thread.set_phase(ThreadPhase::Managed);
            self.release_lock(thread);
        }
    }

    pub(crate) fn try_restore_managed(&self, thread: &Thread<VM>) -> bool {
        if self.lock_owned(thread) {
            thread.set_phase(ThreadPhase::Managed);
            return true;
        }

        if self.try_acquire_lock(thread) {
            thread.set_phase(ThreadPhase::Managed);
            self.release_lock(thread);
            true
        } else {
            false
        }
    }

    pub fn enter_unmanaged(&self, thread: &Thread<VM>) {
        thread.set_phase(ThreadPhase::Unmanaged);
    }

    pub fn enter_waiting(&self, thread: &Thread<VM>) {
        if self.lock_owned(thread) {
            VM::fatal(FatalError::protocol_misuse(
                thread.id(),
                "waiting while holding process-critical lock",
            ));
        }
        thread.set_phase(ThreadPhase::Waiting);
    }

    pub fn is_yielding(&self, thread: &Thread<VM>) -> bool {
        thread.is_yielding()
    }

    /// Safepoint poll for a managed thread.
    ///
    /// When another thread holds the process-critical lock, or the collector wants to
    /// run, the caller steps aside in [`ThreadPhase::Waiting`] and comes back to the
    /// managed phase once it can. Returns whether it stepped aside.
    pub fn check_stop(&self, thread: &Thread<VM>) -> bool {
        let metrics = thread.metrics();
        metrics.checkpoints.fetch_add(1, Ordering::Relaxed);

        let owner = self.lock.load(Ordering::Acquire);
        if owner == thread.id() || (owner == 0 && !VM::collect_requested()) {
            return false;
        }

        thread.set_phase(ThreadPhase::Waiting);
        self.enter_managed(thread);
        metrics.stops.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: stopped at checkpoint", thread.name());
        true
    }

    /// Run `f` in the unmanaged phase and re-enter the managed phase afterwards.
    ///
    /// Code inside `f` must not touch managed state.
    pub fn unmanaged_scope<R>(&self, thread: &Thread<VM>, f: impl FnOnce() -> R) -> R {
        self.enter_unmanaged(thread);
        let result = f();
        self.enter_managed(thread);
        result
    }

    /* Process-critical lock */

    pub fn lock_owned(&self, thread: &Thread<VM>) -> bool {
        self.lock.load(Ordering::Acquire) == thread.id()
    }

    pub fn lock_owner(&self) -> Option<u32> {
        match self.lock.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn try_acquire_lock(&self, thread: &Thread<VM>) -> bool {
        self.lock
            .compare_exchange(0, thread.id(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_lock(&self, thread: &Thread<VM>) {
        if !self.lock_owned(thread) {
            VM::fatal(FatalError::protocol_misuse(
                thread.id(),
                "process-critical lock being unlocked by the wrong thread",
            ));
        }

        self.lock.store(0, Ordering::Release);
        let waiters = self.waiters.lock_no_handshake();
        waiters.notify_all();
    }

    /// Acquire the process-critical lock, waiting with backoff as long as needed.
    ///
    /// While waiting, the thread steps aside whenever the embedder has a collection
    /// pending. Waiting longer than the configured limit is a fatal deadlock.
    pub fn acquire_lock_or_wait(&self, thread: &Thread<VM>) {
        if self.try_acquire_lock(thread) {
            return;
        }

        let metrics = thread.metrics();
        metrics.lock_waits.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{}: waiting for process-critical lock held by {:?}",
            thread.name(),
            self.lock_owner()
        );

        let phase = thread.phase();
        let mut backoff = Backoff::new(&self.options);
        let acquired = backoff.retry_until(
            self.options.lock_limit(),
            || self.try_acquire_lock(thread),
            |delay| {
                if VM::collect_requested() {
                    self.yield_for_collection(thread);
                }
                let mut waiters = self.waiters.lock_no_handshake();
                if self.lock.load(Ordering::Acquire) != 0 {
                    waiters.wait_for_no_handshake(delay);
                }
            },
            |elapsed| self.check_deadlock(elapsed, None),
        );
        metrics.add_wait(backoff.elapsed());

        // A collection yield may have moved a managed waiter to Waiting.
        if acquired && thread.phase() != phase {
            thread.set_phase(phase);
        }
    }

    fn yield_for_collection(&self, thread: &Thread<VM>) {
        if thread.phase() == ThreadPhase::Managed && !self.lock_owned(thread) {
            thread.set_phase(ThreadPhase::Waiting);
        }
        thread.metrics().yields.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: yielding to pending collection", thread.name());
    }

    /// Report a deadlock if `elapsed` is past the configured limit.
    ///
    /// `thread` names the thread that would not yield; without it the wait was for
    /// the process-critical lock. Logs the registry and the offender's backtrace,
    /// then hands the error to [`VirtualMachine::fatal`].
    pub fn check_deadlock(&self, elapsed: Duration, thread: Option<&Thread<VM>>) {
        let limit = self.options.lock_limit();
        if elapsed <= limit {
            return;
        }

        let error = match thread {
            Some(thread) => {
                log::error!(
                    "thread nexus: thread will not yield: {}, {}",
                    thread.name(),
                    thread.phase()
                );
                for line in VM::backtrace(thread) {
                    log::debug!("  {line}");
                }
                FatalError::will_not_yield(thread.id(), &thread.name(), elapsed, limit)
            }
            None => {
                log::error!("thread nexus: unable to lock, possible deadlock");
                FatalError::unable_to_lock(elapsed, limit)
            }
        };

        // The dump must neither wait for the token nor change the caller's phase.
        let threads = self.threads.lock_no_handshake();
        let lines = Self::describe(&threads.borrow());
        drop(threads);
        for line in lines {
            log::error!("  {line}");
        }
        VM::fatal(error)
    }

    /* Stopping the world */

    /// Bring every other registered thread into a yielding phase.
    ///
    /// On return `requester` owns the process-critical lock and is managed; no other
    /// thread can become managed until the lock is released.
    pub fn stop_the_world(&self, requester: &Thread<VM>) {
        if !self.lock_owned(requester) {
            self.acquire_lock_or_wait(requester);
        }

        let threads = self.threads.lock_no_handshake();
        requester.set_phase(ThreadPhase::Managed);
        requester.metrics().world_stops.fetch_add(1, Ordering::Relaxed);

        let others = threads
            .borrow()
            .live()
            .filter(|thread| thread.id() != requester.id())
            .collect::<Vec<_>>();

        let limit = self.options.lock_limit();
        let mut backoff = Backoff::new(&self.options);
        for other in others.iter() {
            backoff.retry_until(
                limit,
                || other.is_yielding(),
                std::thread::sleep,
                |elapsed| self.check_deadlock(elapsed, Some(other.as_ref())),
            );
        }
        drop(threads);

        requester.metrics().add_wait(backoff.elapsed());
        log::debug!(
            "{}: stopped {} threads in {:?}",
            requester.name(),
            others.len(),
            backoff.elapsed()
        );
    }

    /// Stop the world, run `f`, and resume. The lock is released afterwards only if
    /// this call acquired it.
    pub fn stop_the_world_scoped<R>(&self, requester: &Thread<VM>, f: impl FnOnce() -> R) -> R {
        let acquired = !self.lock_owned(requester);
        self.stop_the_world(requester);
        let result = f();
        if acquired {
            self.release_lock(requester);
        }
        result
    }

    /* Registry */

    /// Create and register a new thread with the next id.
    pub fn register_thread(&self, execution: Execution<VM>, name: Option<&str>) -> Arc<Thread<VM>> {
        let threads = self.lock_threads();
        let mut list = threads.borrow_mut();

        let last_id = list.last_id;
        let id = last_id.wrapping_add(1);
        if id < last_id {
            drop(list);
            drop(threads);
            VM::fatal(FatalError::CapacityExhausted { last_id });
        }
        list.last_id = id;

        let thread = Arc::new(Thread::new(id, execution, name));
        list.prune();
        list.threads.push(Arc::downgrade(&thread));
        drop(list);
        drop(threads);

        self.threads_created.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "thread nexus: registered {} (id: {}, kind: {})",
            thread.name(),
            id,
            thread.kind().name()
        );
        thread
    }

    pub fn unregister_thread(&self, thread: &Thread<VM>) {
        let threads = self.lock_threads();
        threads.borrow_mut().threads.retain(|entry| {
            entry.strong_count() > 0 && !std::ptr::eq(entry.as_ptr(), thread)
        });
        drop(threads);

        self.threads_destroyed.fetch_add(1, Ordering::Relaxed);
        log::debug!("thread nexus: unregistered {}", thread.name());
    }

    /// Visit every live registered thread.
    ///
    /// The registry stays locked for the duration; `visitor` may query the registry
    /// again but must not block on another thread that needs it.
    pub fn for_each_thread(&self, mut visitor: impl FnMut(&Arc<Thread<VM>>)) {
        let threads = self.lock_threads();
        let snapshot = threads.borrow().live().collect::<Vec<_>>();
        for thread in snapshot.iter() {
            visitor(thread);
        }
    }

    pub fn threads(&self) -> Vec<Arc<Thread<VM>>> {
        let threads = self.lock_threads();
        let snapshot = threads.borrow().live().collect();
        snapshot
    }

    pub fn is_registered(&self, id: u32) -> bool {
        let threads = self.lock_threads();
        let found = threads.borrow().live().any(|thread| thread.id() == id);
        found
    }

    /// Number of live, non-zombie threads of `kind`.
    pub fn thread_count(&self, kind: ThreadKind) -> usize {
        let mut count = 0;
        self.for_each_thread(|thread| {
            if thread.kind() == kind && !thread.is_zombie() {
                count += 1;
            }
        });
        count
    }

    /// One line per registered thread: `thread <id>: <name>, <phase>`.
    pub fn dump_threads(&self) -> Vec<String> {
        let threads = self.lock_threads();
        let lines = Self::describe(&threads.borrow());
        lines
    }

    fn describe(list: &ThreadList<VM>) -> Vec<String> {
        list.live()
            .map(|thread| {
                format!(
                    "thread {}: {}, {}",
                    thread.id(),
                    thread.name(),
                    thread.phase()
                )
            })
            .collect()
    }

    pub fn threads_created(&self) -> u64 {
        self.threads_created.load(Ordering::Relaxed)
    }

    pub fn threads_destroyed(&self) -> u64 {
        self.threads_destroyed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_thread_id(&self, id: u32) {
        self.threads.lock_no_handshake().borrow_mut().last_id = id;
    }
}
