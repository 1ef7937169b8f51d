use std::{
    any::Any,
    cell::OnceCell,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{
    error::FatalError,
    platform::{self, NativeHandle},
    VirtualMachine,
};

/// Threads use a three-valued phase to tell the nexus how they should be treated
/// when some thread wants to stop the world.
///
/// The encoding shares a single "yielding" bit between [`Unmanaged`](Self::Unmanaged)
/// and [`Waiting`](Self::Waiting), so deciding whether a thread may be ignored by a
/// stopper is one mask test on one atomic load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadPhase {
    /// Thread is executing interpreted code and may touch the managed heap at
    /// any moment. A stopper has to wait for it.
    Managed = 0x01,
    /// Thread is in native or blocking code that does not touch managed state.
    /// Entering it never requires the process-critical lock.
    Unmanaged = 0x82,
    /// Thread has voluntarily parked, e.g. on a condition variable. A thread
    /// must never enter this phase while it holds the process-critical lock.
    Waiting = 0x84,
}

impl ThreadPhase {
    pub const YIELDING: u8 = 0x80;

    pub const fn is_yielding(self) -> bool {
        (self as u8) & Self::YIELDING == Self::YIELDING
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Unmanaged => "unmanaged",
            Self::Waiting => "waiting",
        }
    }
}

impl fmt::Display for ThreadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

unsafe impl bytemuck::NoUninit for ThreadPhase {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Backs a language-level thread object.
    Thread,
    /// A cooperative fiber multiplexed onto some native thread.
    Fiber,
    /// Runtime helper (signal handling, finalization, ...) with no language object.
    System,
}

impl ThreadKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Fiber => "fiber",
            Self::System => "system",
        }
    }
}

/// Language-level thread object owned by the embedding VM.
pub trait LanguageThread: Send + Sync + 'static {
    /// The native thread backing this object did not survive a fork.
    fn mark_stopped(&self);

    /// This object belongs to the thread that forked. Point its current fiber
    /// back at its own root fiber so it keeps running in the child.
    fn relink_current(&self);
}

/// Language-level fiber object owned by the embedding VM.
pub trait Fiber: Send + Sync + 'static {
    /// The fiber cannot be resumed any more.
    fn mark_dead(&self);
}

/// What a [`Thread`] executes, tagged by kind.
///
/// The language payloads are optional because a thread record may be created before
/// its language object, and because abandoned records drop theirs.
pub enum Execution<VM: VirtualMachine> {
    Thread(Option<VM::LanguageThread>),
    Fiber(Option<VM::Fiber>),
    System,
}

impl<VM: VirtualMachine> Execution<VM> {
    pub fn kind(&self) -> ThreadKind {
        match self {
            Self::Thread(_) => ThreadKind::Thread,
            Self::Fiber(_) => ThreadKind::Fiber,
            Self::System => ThreadKind::System,
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Thread(handle) => *handle = None,
            Self::Fiber(fiber) => *fiber = None,
            Self::System => {}
        }
    }
}

/// Counters collected for a single thread. Created on first use.
#[derive(Debug, Default)]
pub struct ThreadMetrics {
    /// Safepoint polls made through `check_stop`.
    pub checkpoints: AtomicU64,
    /// Polls that actually stepped aside for another thread.
    pub stops: AtomicU64,
    /// Stop-the-world operations this thread performed.
    pub world_stops: AtomicU64,
    /// Acquisitions of the process-critical lock that had to wait.
    pub lock_waits: AtomicU64,
    /// Times this thread stepped aside for a pending collection while waiting.
    pub yields: AtomicU64,
    /// Total time spent in backoff waits, in nanoseconds.
    pub wait_ns: AtomicU64,
}

impl ThreadMetrics {
    pub fn add_wait(&self, waited: Duration) {
        self.wait_ns
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }
}

thread_local! {
    static CURRENT_THREAD: OnceCell<Arc<dyn Any + Send + Sync>> = const { OnceCell::new() };
}

/// Identity and execution context of one execution unit.
///
/// Construction has no side effects; a thread becomes visible to the nexus only
/// through [`ThreadNexus::register_thread`](crate::nexus::ThreadNexus::register_thread).
pub struct Thread<VM: VirtualMachine> {
    id: u32,
    kind: ThreadKind,
    name: Mutex<String>,
    /// Bound once, by [`publish_current`](Self::publish_current).
    os_thread: OnceLock<NativeHandle>,
    phase: Atomic<ThreadPhase>,
    execution: Mutex<Execution<VM>>,
    metrics: OnceLock<ThreadMetrics>,
    zombie: AtomicBool,
    canceled: AtomicBool,
    discarded: AtomicBool,
}

unsafe impl<VM: VirtualMachine> Send for Thread<VM> {}
unsafe impl<VM: VirtualMachine> Sync for Thread<VM> {}

impl<VM: VirtualMachine> Thread<VM> {
    /// Build a thread record. Without a `name` the thread is called
    /// `<VM::THREAD_NAME_PREFIX>.<id>`.
    pub fn new(id: u32, execution: Execution<VM>, name: Option<&str>) -> Self {
        debug_assert!(id != 0, "thread id 0 marks the unlocked token");
        let name = match name {
            Some(name) => name.to_owned(),
            None => format!("{}.{}", VM::THREAD_NAME_PREFIX, id),
        };

        Self {
            id,
            kind: execution.kind(),
            name: Mutex::new(name),
            os_thread: OnceLock::new(),
            phase: Atomic::new(ThreadPhase::Unmanaged),
            execution: Mutex::new(execution),
            metrics: OnceLock::new(),
            zombie: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Change the display name. When called from the native thread this identity
    /// was published on, the OS-visible name follows.
    pub fn rename(&self, name: &str) {
        name.clone_into(&mut self.name.lock());
        if let Some(&handle) = self.os_thread.get() {
            if platform::is_current(handle) {
                platform::set_current_os_name(name);
            }
        }
    }

    pub fn native_handle(&self) -> Option<NativeHandle> {
        self.os_thread.get().copied()
    }

    pub fn phase(&self) -> ThreadPhase {
        self.phase.load(Ordering::Acquire)
    }

    /// Only the owning thread changes its own phase, through the nexus. Fork
    /// recovery is the single exception.
    pub(crate) fn set_phase(&self, phase: ThreadPhase) {
        self.phase.store(phase, Ordering::Release);
    }

    pub fn is_yielding(&self) -> bool {
        self.phase().is_yielding()
    }

    pub fn metrics(&self) -> &ThreadMetrics {
        self.metrics.get_or_init(ThreadMetrics::default)
    }

    pub fn with_execution<R>(&self, f: impl FnOnce(&Execution<VM>) -> R) -> R {
        f(&self.execution.lock())
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }

    /// Abandon the record: drop its language payload and never run it again.
    pub(crate) fn set_zombie(&self) {
        self.execution.lock().clear();
        self.zombie.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub(crate) fn set_discarded(&self) {
        self.set_zombie();
        self.discarded.store(true, Ordering::Release);
    }

    /// The identity published on the calling native thread, if any.
    pub fn current() -> Option<Arc<Thread<VM>>> {
        CURRENT_THREAD
            .with(|slot| slot.get().cloned())
            .and_then(|thread| thread.downcast::<Thread<VM>>().ok())
    }

    /// Bind this identity to the calling native thread: name the OS thread after it,
    /// record the native handle and make it the result of [`current`](Self::current).
    ///
    /// Must happen exactly once per native thread, before any nexus operation that
    /// looks up the current thread. Publishing twice on one native thread, or one
    /// identity on two native threads, is a fatal protocol misuse.
    pub fn publish_current(self: &Arc<Self>) {
        CURRENT_THREAD.with(|slot| {
            if slot.get().is_some() {
                VM::fatal(FatalError::protocol_misuse(
                    self.id,
                    "native thread already published an identity",
                ));
            }

            if self.os_thread.set(platform::current_native_handle()).is_err() {
                VM::fatal(FatalError::protocol_misuse(
                    self.id,
                    "identity already published on another native thread",
                ));
            }

            platform::set_current_os_name(&self.name());
            let _ = slot.set(self.clone() as Arc<dyn Any + Send + Sync>);
        });
        log::trace!("{}: published as current thread", self.name());
    }
}

impl<VM: VirtualMachine> fmt::Debug for Thread<VM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &*self.name.lock())
            .field("phase", &self.phase())
            .field("zombie", &self.is_zombie())
            .finish()
    }
}

impl<VM: VirtualMachine> Drop for Thread<VM> {
    fn drop(&mut self) {
        if let Some(metrics) = self.metrics.get() {
            log::info!(
                "{}: checkpoints: {}, stops: {}, world stops: {}, lock waits: {}, yields: {}, waited: {:?}",
                self.name.get_mut(),
                metrics.checkpoints.load(Ordering::Relaxed),
                metrics.stops.load(Ordering::Relaxed),
                metrics.world_stops.load(Ordering::Relaxed),
                metrics.lock_waits.load(Ordering::Relaxed),
                metrics.yields.load(Ordering::Relaxed),
                Duration::from_nanos(metrics.wait_ns.load(Ordering::Relaxed)),
            );
        }
    }
}
