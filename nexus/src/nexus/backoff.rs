//! Jittered, bounded waiting.
//!
//! Every blocking wait in the nexus walks a fixed table of short delays and keeps a
//! running total of the time it actually spent waiting. Once the total passes the
//! configured ceiling the wait is handed to a timeout callback, which in the nexus
//! reports a deadlock.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::options::Options;

/// Delays in nanoseconds. Irregular on purpose so that threads released together
/// do not retry in lockstep.
pub const DELAYS_NS: [u64; 20] = [
    133, 464, 254, 306, 549, 287, 358, 638, 496, 81, 472, 288, 131, 31, 435, 258, 221, 73, 537,
    854,
];

#[derive(Debug, Clone)]
pub struct Backoff {
    index: usize,
    elapsed: Duration,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(options: &Options) -> Self {
        let index = if options.no_jitter {
            0
        } else {
            rand::rng().random_range(0..DELAYS_NS.len())
        };

        Self {
            index,
            elapsed: Duration::ZERO,
            last_delay: Duration::ZERO,
        }
    }

    /// Next delay from the table, wrapping around at its end.
    pub fn next_delay(&mut self) -> Duration {
        let delay = DELAYS_NS[self.index % DELAYS_NS.len()];
        self.index = (self.index + 1) % DELAYS_NS.len();
        Duration::from_nanos(delay)
    }

    /// Total time recorded so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Duration of the most recent recorded wait.
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    pub fn record(&mut self, waited: Duration) {
        self.elapsed += waited;
        self.last_delay = waited;
    }

    /// Sleep for the next delay and record how long the sleep really took.
    pub fn snooze(&mut self) -> Duration {
        let delay = self.next_delay();
        let start = Instant::now();
        std::thread::sleep(delay);
        self.record(start.elapsed());
        self.elapsed
    }

    /// Poll `ready` until it holds, calling `wait` with the next delay between polls.
    ///
    /// When the recorded total exceeds `limit`, `on_timeout` receives it and the
    /// retry gives up, returning `false`. The total is only compared after a wait,
    /// so it overshoots `limit` by at most one wait.
    pub fn retry_until(
        &mut self,
        limit: Duration,
        mut ready: impl FnMut() -> bool,
        mut wait: impl FnMut(Duration),
        on_timeout: impl FnOnce(Duration),
    ) -> bool {
        while !ready() {
            let delay = self.next_delay();
            let start = Instant::now();
            wait(delay);
            self.record(start.elapsed());

            if self.elapsed > limit {
                on_timeout(self.elapsed);
                return false;
            }
        }
        true
    }
}
