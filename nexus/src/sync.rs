//! Synchronization primitives for the nexus.
//!
//! Provides synchronization primitives which are friendly to the safepoint protocol. Locking
//! comes in `*_with_handshake` and `*_no_handshake` flavours. The former declares the calling
//! thread [`Unmanaged`](crate::threading::ThreadPhase::Unmanaged) while it blocks, so a thread
//! stopping the world does not have to wait for it; the latter blocks without telling anyone.
//! `*_no_handshake` methods should be used by the nexus itself, by the thread that holds the
//! process-critical lock, and by threads that are not in the managed phase anyway.
pub mod monitor;

pub use monitor::*;
