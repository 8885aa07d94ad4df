//! Resource ceilings for one constrained command.

use std::num::NonZeroU32;
use std::time::Duration;

/// CPU, wall-clock, memory and process-count limits applied to a single run.
///
/// Values are fixed once built; the `with_*` methods return a modified copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
    cpu_time: Duration,
    extra_cpu_time: Duration,
    wall_time: Duration,
    memory_limit_kb: u64,
    max_processes: NonZeroU32,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            cpu_time: Duration::from_secs(1),
            extra_cpu_time: Duration::from_millis(500),
            wall_time: Duration::from_secs(10),
            memory_limit_kb: 256_000,
            max_processes: NonZeroU32::MIN,
        }
    }
}

impl Constraints {
    /// Envelope for compiler invocations: toolchains fork helpers (`cc1plus`,
    /// `as`, `ld`) and need more time and memory than the submission itself.
    pub fn compilation() -> Self {
        Self {
            cpu_time: Duration::from_secs(10),
            extra_cpu_time: Duration::from_secs(1),
            wall_time: Duration::from_secs(20),
            memory_limit_kb: 512_000,
            max_processes: NonZeroU32::new(32).unwrap_or(NonZeroU32::MIN),
        }
    }

    pub fn with_cpu_time(mut self, limit: Duration) -> Self {
        self.cpu_time = limit;
        self
    }

    pub fn with_extra_cpu_time(mut self, limit: Duration) -> Self {
        self.extra_cpu_time = limit;
        self
    }

    pub fn with_wall_time(mut self, limit: Duration) -> Self {
        self.wall_time = limit;
        self
    }

    pub fn with_memory_limit_kb(mut self, limit: u64) -> Self {
        self.memory_limit_kb = limit;
        self
    }

    pub fn with_max_processes(mut self, limit: NonZeroU32) -> Self {
        self.max_processes = limit;
        self
    }

    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    pub fn extra_cpu_time(&self) -> Duration {
        self.extra_cpu_time
    }

    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_kb
    }

    pub fn max_processes(&self) -> NonZeroU32 {
        self.max_processes
    }

    /// Limit flags in the order `isolate --run` expects them.
    pub fn isolate_args(&self) -> Vec<String> {
        vec![
            format!("--mem={}", self.memory_limit_kb),
            format!("--time={:.3}", self.cpu_time.as_secs_f64()),
            format!("--extra-time={:.3}", self.extra_cpu_time.as_secs_f64()),
            format!("--wall-time={:.3}", self.wall_time.as_secs_f64()),
            format!("--processes={}", self.max_processes),
        ]
    }
}
