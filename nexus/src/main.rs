use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use clap::Parser;
use nexus::{platform, prelude::*};

#[derive(Parser, Debug)]
#[clap(name = "nexus-demo", about = "Worker threads cooperating with periodic stop-the-world pauses")]
struct Args {
    #[clap(flatten)]
    options: Options,

    /// Number of worker threads.
    #[clap(long, default_value_t = 4)]
    workers: usize,

    /// Stop-the-world pauses performed by the main thread.
    #[clap(long, default_value_t = 100)]
    rounds: usize,
}

struct DemoThread {
    stopped: AtomicBool,
}

impl LanguageThread for DemoThread {
    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn relink_current(&self) {}
}

struct DemoFiber;

impl Fiber for DemoFiber {
    fn mark_dead(&self) {}
}

struct DemoVM;

static NEXUS: OnceLock<ThreadNexus<DemoVM>> = OnceLock::new();
static COLLECT: AtomicBool = AtomicBool::new(false);
static STEPS: AtomicU64 = AtomicU64::new(0);

fn nexus() -> &'static ThreadNexus<DemoVM> {
    NEXUS.get_or_init(ThreadNexus::new)
}

impl VirtualMachine for DemoVM {
    type LanguageThread = DemoThread;
    type Fiber = DemoFiber;
    const THREAD_NAME_PREFIX: &'static str = "demo";

    fn collect_requested() -> bool {
        COLLECT.load(Ordering::Relaxed)
    }

    fn backtrace(thread: &Thread<Self>) -> Vec<String> {
        match thread.native_handle() {
            Some(handle) if platform::is_current(handle) => {
                std::backtrace::Backtrace::force_capture()
                    .to_string()
                    .lines()
                    .map(str::to_owned)
                    .collect()
            }
            _ => vec![format!("<{} is running elsewhere>", thread.name())],
        }
    }
}

fn worker(thread: Arc<Thread<DemoVM>>, done: Arc<AtomicBool>) {
    thread.publish_current();
    let nexus = nexus();

    nexus.enter_managed(&thread);
    while !done.load(Ordering::Relaxed) {
        for _ in 0..64 {
            std::hint::spin_loop();
        }
        STEPS.fetch_add(1, Ordering::Relaxed);

        nexus.check_stop(&thread);

        if STEPS.load(Ordering::Relaxed) % 1024 == 0 {
            nexus.unmanaged_scope(&thread, || std::thread::sleep(Duration::from_micros(50)));
        }
    }
    nexus.enter_unmanaged(&thread);
    nexus.unregister_thread(&thread);
}

fn main() {
    nexus::init_logging();
    let args = Args::parse();
    let nexus = NEXUS.get_or_init(|| ThreadNexus::with_options(args.options.clone()));

    let main = nexus.register_thread(
        Execution::Thread(Some(DemoThread {
            stopped: AtomicBool::new(false),
        })),
        Some("demo.main"),
    );
    main.publish_current();

    let done = Arc::new(AtomicBool::new(false));
    let handles = (0..args.workers)
        .map(|_| {
            let thread = nexus.register_thread(
                Execution::Thread(Some(DemoThread {
                    stopped: AtomicBool::new(false),
                })),
                None,
            );
            let done = done.clone();
            std::thread::spawn(move || worker(thread, done))
        })
        .collect::<Vec<_>>();

    let start = Instant::now();
    let mut paused = Duration::ZERO;
    for _ in 0..args.rounds {
        std::thread::sleep(Duration::from_millis(1));

        COLLECT.store(true, Ordering::Relaxed);
        let pause = nexus.stop_the_world_scoped(&main, || {
            let start = Instant::now();
            let managed = nexus
                .threads()
                .iter()
                .filter(|thread| thread.id() != main.id() && !thread.is_yielding())
                .count();
            assert_eq!(managed, 0, "world is not stopped");
            start.elapsed()
        });
        COLLECT.store(false, Ordering::Relaxed);
        nexus.enter_unmanaged(&main);
        paused += pause;
    }

    done.store(true, Ordering::Relaxed);
    for handle in handles {
        if handle.join().is_err() {
            log::error!("worker panicked");
        }
    }

    println!(
        "{} workers, {} pauses, {} steps in {:?} ({:?} inside pauses)",
        args.workers,
        args.rounds,
        STEPS.load(Ordering::Relaxed),
        start.elapsed(),
        paused
    );
    println!(
        "threads created: {}, registered now: {}",
        nexus.threads_created(),
        nexus.thread_count(ThreadKind::Thread)
    );
}
