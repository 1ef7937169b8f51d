use std::{sync::LazyLock, time::Duration};

use clap::Parser;

/// Tunables of the thread nexus.
///
/// The process-wide [`OPTIONS`] are read from the `NEXUS_OPTIONS` environment
/// variable, e.g. `NEXUS_OPTIONS="--lock-limit-ms 250 --no-jitter"`.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(name = "nexus")]
pub struct Options {
    /// Cumulative time a thread may wait for the process-critical lock, or for
    /// another thread to yield, before the wait is reported as a deadlock.
    #[clap(long, default_value_t = 5000)]
    pub lock_limit_ms: u64,

    /// Start every backoff sequence at the head of the delay table instead of
    /// at a random position.
    #[clap(long, default_value_t = false)]
    pub no_jitter: bool,
}

impl Options {
    pub const ENV: &'static str = "NEXUS_OPTIONS";

    pub fn lock_limit(&self) -> Duration {
        Duration::from_millis(self.lock_limit_ms)
    }

    pub fn with_lock_limit(mut self, limit: Duration) -> Self {
        self.lock_limit_ms = limit.as_millis() as u64;
        self
    }

    pub fn from_env() -> Self {
        let Ok(flags) = std::env::var(Self::ENV) else {
            return Self::default();
        };

        let args = std::iter::once("nexus").chain(flags.split_whitespace());
        match Self::try_parse_from(args) {
            Ok(options) => options,
            Err(err) => {
                log::warn!("ignoring invalid {}: {}", Self::ENV, err);
                Self::default()
            }
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lock_limit_ms: 5000,
            no_jitter: false,
        }
    }
}

pub static OPTIONS: LazyLock<Options> = LazyLock::new(Options::from_env);
