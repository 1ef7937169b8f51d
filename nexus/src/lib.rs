//! Safepoint coordination for a managed runtime.
//!
//! Native threads executing interpreted code register with a [`ThreadNexus`] and declare
//! a [`ThreadPhase`] as they go. Any thread may then stop the world: once every other
//! thread is observed outside the managed phase, none can re-enter it until the stopper
//! releases the process-critical lock.
//!
//! The embedding runtime describes itself through [`VirtualMachine`].

use std::sync::Arc;

pub mod macros;
pub mod error;
pub mod nexus;
pub mod options;
pub mod platform;
pub mod sync;
pub mod threading;

pub use error::FatalError;
pub use nexus::{backoff::Backoff, ThreadNexus};
pub use options::{Options, OPTIONS};
pub use threading::{Execution, Thread, ThreadKind, ThreadPhase};

pub trait VirtualMachine: Sized + 'static + Send + Sync {
    /// Language-level thread object carried by [`Execution::Thread`].
    type LanguageThread: threading::LanguageThread;
    /// Language-level fiber object carried by [`Execution::Fiber`].
    type Fiber: threading::Fiber;

    /// Prefix of generated thread names, `<prefix>.<id>`.
    const THREAD_NAME_PREFIX: &'static str = "vm";

    /// Is the collector waiting to stop the world? Consulted by threads waiting for
    /// the process-critical lock, which step aside while this returns `true`.
    fn collect_requested() -> bool {
        false
    }

    /// Fork recovery made `thread` the only thread of the process.
    fn set_root_thread(thread: &Arc<Thread<Self>>) {
        let _ = thread;
    }

    /// Pre-formatted backtrace of `thread`, appended to deadlock reports.
    fn backtrace(thread: &Thread<Self>) -> Vec<String> {
        let _ = thread;
        Vec::new()
    }

    /// Report a condition the nexus cannot recover from. Never returns.
    fn fatal(error: FatalError) -> ! {
        log::error!("{error}");
        std::process::abort()
    }
}

/// Initialize `env_logger`, filtered by the `NEXUS_LOG` environment variable.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_logging() {
    let _ = env_logger::try_init_from_env(env_logger::Env::new().filter("NEXUS_LOG"));
}

pub mod prelude {
    pub use crate::{
        error::FatalError,
        nexus::ThreadNexus,
        options::Options,
        threading::{Execution, Fiber, LanguageThread, Thread, ThreadKind, ThreadPhase},
        VirtualMachine,
    };
}
