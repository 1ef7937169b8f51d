#![allow(dead_code)]

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use nexus::prelude::*;

/// Set by tests that simulate a pending collection.
pub static COLLECT: AtomicBool = AtomicBool::new(false);

pub struct TestVM;

#[derive(Default)]
pub struct ThreadFlags {
    pub stopped: AtomicBool,
    pub relinked: AtomicBool,
}

/// Language thread payload. Clones share their flags so tests can observe them
/// after the payload has been moved into a [`Thread`].
#[derive(Clone, Default)]
pub struct TestThread(pub Arc<ThreadFlags>);

impl LanguageThread for TestThread {
    fn mark_stopped(&self) {
        self.0.stopped.store(true, Ordering::Relaxed);
    }

    fn relink_current(&self) {
        self.0.relinked.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone, Default)]
pub struct TestFiber(pub Arc<AtomicBool>);

impl TestFiber {
    pub fn is_dead(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Fiber for TestFiber {
    fn mark_dead(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl VirtualMachine for TestVM {
    type LanguageThread = TestThread;
    type Fiber = TestFiber;
    const THREAD_NAME_PREFIX: &'static str = "test";

    fn collect_requested() -> bool {
        COLLECT.load(Ordering::Relaxed)
    }

    fn backtrace(thread: &Thread<Self>) -> Vec<String> {
        vec![format!("#0 {} parked in test", thread.name())]
    }

    fn fatal(error: FatalError) -> ! {
        std::panic::panic_any(error)
    }
}

pub fn nexus(limit_ms: u64) -> Arc<ThreadNexus<TestVM>> {
    nexus::init_logging();
    Arc::new(ThreadNexus::with_options(Options {
        lock_limit_ms: limit_ms,
        no_jitter: false,
    }))
}

pub fn language_thread(nexus: &ThreadNexus<TestVM>) -> Arc<Thread<TestVM>> {
    nexus.register_thread(Execution::Thread(Some(TestThread::default())), None)
}

/// Run `f`, which must end in [`VirtualMachine::fatal`], and return the error.
pub fn fatal_of<R>(f: impl FnOnce() -> R) -> FatalError {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("expected a fatal error"),
        Err(payload) => match payload.downcast::<FatalError>() {
            Ok(error) => *error,
            Err(_) => panic!("panicked with something other than a FatalError"),
        },
    }
}

/// Poll `condition` for up to two seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
