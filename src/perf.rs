//! CPU / memory sampler for the supervised worker process.
//!
//! Backed by `sysinfo`, refreshed at most once a second.  Cheap enough to
//! call from the tick loop; between refreshes the last sample is returned.

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Minimum spacing between process refreshes.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time usage of the supervised process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfSample {
    pub cpu_percent: u8,
    pub memory_mb: u16,
}

pub struct PerfSampler {
    sys: System,
    pid: Option<Pid>,
    last_refresh: Option<Instant>,
    last_sample: PerfSample,
}

impl PerfSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: None,
            last_refresh: None,
            last_sample: PerfSample::default(),
        }
    }

    /// Bind the sampler to a freshly-launched worker's PID.
    pub fn bind(&mut self, pid: u32) {
        self.pid = Some(Pid::from_u32(pid));
        self.last_refresh = None;
        self.last_sample = PerfSample::default();
    }

    /// Unbind; samples read as zero until the next bind.
    pub fn clear(&mut self) {
        self.pid = None;
        self.last_sample = PerfSample::default();
    }

    /// Current usage, refreshing at most once per [`SAMPLE_INTERVAL`].
    pub fn sample(&mut self) -> PerfSample {
        let Some(pid) = self.pid else {
            return PerfSample::default();
        };

        let due = self
            .last_refresh
            .map(|at| at.elapsed() >= SAMPLE_INTERVAL)
            .unwrap_or(true);
        if due {
            self.last_refresh = Some(Instant::now());
            self.sys
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = self.sys.process(pid) {
                self.last_sample = PerfSample {
                    cpu_percent: process.cpu_usage().clamp(0.0, 100.0) as u8,
                    memory_mb: (process.memory() / (1024 * 1024)).min(u16::MAX as u64) as u16,
                };
            } else {
                // Process gone; the supervisor will notice on its next poll.
                self.last_sample = PerfSample::default();
            }
        }

        self.last_sample
    }
}

impl Default for PerfSampler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
