mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use common::*;
use nexus::prelude::*;
use parking_lot::Mutex;

#[test]
fn at_most_one_token_holder() {
    let nexus = nexus(5000);
    let holders = Arc::new(AtomicUsize::new(0));

    let handles = (0..6)
        .map(|i| {
            let thread = language_thread(&nexus);
            let nexus = nexus.clone();
            let holders = holders.clone();
            std::thread::spawn(move || {
                for round in 0..300 {
                    match (i + round) % 3 {
                        0 => {
                            nexus.acquire_lock_or_wait(&thread);
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(nexus.lock_owner(), Some(thread.id()));
                            std::hint::spin_loop();
                            holders.fetch_sub(1, Ordering::SeqCst);
                            nexus.release_lock(&thread);
                        }
                        1 => {
                            nexus.enter_managed(&thread);
                            assert_eq!(thread.phase(), ThreadPhase::Managed);
                            nexus.enter_unmanaged(&thread);
                        }
                        _ => {
                            nexus.enter_waiting(&thread);
                            assert!(nexus.is_yielding(&thread));
                        }
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(nexus.lock_owner(), None);
}

#[test]
fn waiting_while_holding_the_token_is_fatal() {
    let nexus = nexus(5000);
    let thread = language_thread(&nexus);
    assert!(nexus.try_acquire_lock(&thread));

    let error = fatal_of(|| nexus.enter_waiting(&thread));
    assert_eq!(
        error,
        FatalError::protocol_misuse(thread.id(), "waiting while holding process-critical lock")
    );
    assert_ne!(thread.phase(), ThreadPhase::Waiting);
}

#[test]
fn release_by_non_holder_is_fatal() {
    let nexus = nexus(5000);
    let owner = language_thread(&nexus);
    let other = language_thread(&nexus);

    let error = fatal_of(|| nexus.release_lock(&other));
    assert!(matches!(error, FatalError::ProtocolMisuse { thread, .. } if thread == other.id()));

    assert!(nexus.try_acquire_lock(&owner));
    let error = fatal_of(|| nexus.release_lock(&other));
    assert!(error.to_string().contains("unlocked by the wrong thread"));
    assert_eq!(nexus.lock_owner(), Some(owner.id()));
}

#[test]
fn try_acquire_lock_fails_without_side_effects() {
    let nexus = nexus(5000);
    let owner = language_thread(&nexus);
    let other = language_thread(&nexus);
    assert!(nexus.try_acquire_lock(&owner));

    let start = Instant::now();
    assert!(!nexus.try_acquire_lock(&other));
    assert!(!nexus.try_enter_managed(&other));
    assert!(start.elapsed() < Duration::from_millis(100));

    assert_eq!(nexus.lock_owner(), Some(owner.id()));
    assert_eq!(other.phase(), ThreadPhase::Unmanaged);
    assert!(other.metrics().lock_waits.load(Ordering::Relaxed) == 0);
}

#[test]
fn owner_enters_managed_without_reacquiring() {
    let nexus = nexus(50);
    let owner = language_thread(&nexus);
    assert!(nexus.try_acquire_lock(&owner));

    nexus.enter_managed(&owner);
    assert_eq!(owner.phase(), ThreadPhase::Managed);
    assert!(nexus.try_enter_managed(&owner));
    assert!(nexus.lock_owned(&owner));

    nexus.release_lock(&owner);
    assert_eq!(nexus.lock_owner(), None);
}

#[test]
fn enter_managed_releases_the_token() {
    let nexus = nexus(5000);
    let thread = language_thread(&nexus);

    nexus.enter_managed(&thread);
    assert_eq!(thread.phase(), ThreadPhase::Managed);
    assert_eq!(nexus.lock_owner(), None);

    nexus.enter_unmanaged(&thread);
    assert!(nexus.try_enter_managed(&thread));
    assert_eq!(nexus.lock_owner(), None);
}

#[test]
fn release_wakes_a_waiter() {
    let nexus = nexus(5000);
    let owner = language_thread(&nexus);
    let waiter = language_thread(&nexus);
    assert!(nexus.try_acquire_lock(&owner));

    let handle = {
        let nexus = nexus.clone();
        let waiter = waiter.clone();
        std::thread::spawn(move || {
            nexus.enter_managed(&waiter);
            waiter.phase()
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(waiter.phase(), ThreadPhase::Unmanaged);
    nexus.release_lock(&owner);

    assert_eq!(handle.join().unwrap(), ThreadPhase::Managed);
    assert_eq!(waiter.metrics().lock_waits.load(Ordering::Relaxed), 1);
    assert!(waiter.metrics().wait_ns.load(Ordering::Relaxed) > 0);
}

#[test]
fn lock_wait_past_the_limit_is_a_deadlock() {
    let limit = Duration::from_millis(30);
    let nexus = nexus(limit.as_millis() as u64);
    let owner = language_thread(&nexus);
    let waiter = language_thread(&nexus);
    assert!(nexus.try_acquire_lock(&owner));

    let error = fatal_of(|| nexus.acquire_lock_or_wait(&waiter));
    match error {
        FatalError::Deadlock {
            thread: None,
            elapsed,
            limit: reported,
            ..
        } => {
            assert_eq!(reported, limit);
            assert!(elapsed > limit);
            assert!(elapsed - limit < Duration::from_millis(250));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(nexus.lock_owner(), Some(owner.id()));
}

#[test]
fn second_halt_is_fatal() {
    let nexus = nexus(5000);
    let halter = language_thread(&nexus);
    let other = language_thread(&nexus);

    nexus.request_halt(&halter);
    assert_eq!(nexus.halting_thread(), Some(halter.id()));

    let error = fatal_of(|| nexus.request_halt(&other));
    assert!(error.to_string().contains("halting mutex is already locked"));
    let error = fatal_of(|| nexus.request_halt(&halter));
    assert!(matches!(error, FatalError::ProtocolMisuse { .. }));
}

#[test]
fn halt_gates_other_threads() {
    let nexus = nexus(5000);
    let halter = language_thread(&nexus);
    let other = language_thread(&nexus);
    nexus.enter_managed(&other);

    nexus.request_halt(&halter);
    assert!(!nexus.try_enter_managed(&other));

    // The halter itself is not gated.
    nexus.enter_managed(&halter);
    assert_eq!(halter.phase(), ThreadPhase::Managed);

    {
        let nexus = nexus.clone();
        let other = other.clone();
        // Blocks for the rest of the process.
        std::thread::spawn(move || nexus.enter_managed(&other));
    }
    assert!(eventually(|| other.phase() == ThreadPhase::Waiting));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(other.phase(), ThreadPhase::Waiting);
    assert!(nexus.is_yielding(&other));
}

#[test]
fn unmanaged_scope_returns_to_managed() {
    let nexus = nexus(5000);
    let thread = language_thread(&nexus);
    nexus.enter_managed(&thread);

    let inside = nexus.unmanaged_scope(&thread, || thread.phase());
    assert_eq!(inside, ThreadPhase::Unmanaged);
    assert_eq!(thread.phase(), ThreadPhase::Managed);
}

#[test]
fn deadlock_report_from_a_managed_thread_does_not_wait_again() {
    let limit = Duration::from_millis(100);
    let nexus = nexus(limit.as_millis() as u64);
    let owner = language_thread(&nexus);
    let waiter = language_thread(&nexus);

    let handle = {
        let nexus = nexus.clone();
        let waiter = waiter.clone();
        std::thread::spawn(move || {
            waiter.publish_current();
            nexus.enter_managed(&waiter);
            assert!(nexus.try_acquire_lock(&owner));

            let start = Instant::now();
            let error = fatal_of(|| nexus.acquire_lock_or_wait(&waiter));
            (error, start.elapsed())
        })
    };

    let (error, wall) = handle.join().unwrap();
    assert!(error.is_deadlock());
    assert!(wall >= limit);
    assert!(wall < limit + limit * 4 / 5, "reported after {wall:?}");
    assert_eq!(waiter.phase(), ThreadPhase::Managed);
}

#[test]
fn registry_queries_do_not_block_on_a_halt() {
    let nexus = nexus(5000);
    let halter = language_thread(&nexus);
    let worker = language_thread(&nexus);
    let ready = Arc::new(AtomicBool::new(false));
    let results = Arc::new(Mutex::new(None));

    {
        let nexus = nexus.clone();
        let worker = worker.clone();
        let ready = ready.clone();
        let results = results.clone();
        std::thread::spawn(move || {
            worker.publish_current();
            nexus.enter_managed(&worker);
            ready.store(true, Ordering::SeqCst);
            while nexus.halting_thread().is_none() {
                std::thread::yield_now();
            }

            let registered = nexus.is_registered(1);
            let count = nexus.threads().len();
            let lines = nexus.dump_threads().len();
            let extra = nexus.register_thread(Execution::System, None);
            *results.lock() = Some((registered, count, lines, extra.id(), worker.phase()));
        });
    }

    assert!(eventually(|| ready.load(Ordering::SeqCst)));
    nexus.request_halt(&halter);

    assert!(eventually(|| results.lock().is_some()));
    let results = results.lock().take();
    assert_eq!(results, Some((true, 2, 2, 3, ThreadPhase::Managed)));
}
