//! Fixed-TTL memory of recently-handled job ids.
//!
//! Masters rebroadcast offers and the kernel happily queues duplicates on
//! our socket, so without this an agent would accept the same job several
//! times.  Entries live for a fixed window and are purged before every
//! check; this is retransmission tolerance, not a durability guarantee.

use std::time::{Duration, Instant};

use crate::job::JobId;

/// How long a handled job id stays on the reject list.
pub const JOB_MEMORY_TTL: Duration = Duration::from_secs(60);

pub struct JobMemory {
    ttl: Duration,
    entries: Vec<(JobId, Instant)>,
}

impl JobMemory {
    pub fn new() -> Self {
        Self::with_ttl(JOB_MEMORY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Vec::new(),
        }
    }

    /// Drop entries older than the TTL.  Called before every lookup.
    pub fn purge(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        self.entries.retain(|(_, seen)| now.duration_since(*seen) < ttl);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.entries.iter().any(|(known, _)| *known == id)
    }

    /// Record a processed id.  Ids are recorded exactly once per window;
    /// re-recording a live id just refreshes nothing.
    pub fn record(&mut self, id: JobId) {
        if !self.contains(id) {
            self.entries.push((id, Instant::now()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for JobMemory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut memory = JobMemory::new();
        let id = JobId([1, 2, 3, 4]);

        assert!(!memory.contains(id));
        memory.record(id);
        assert!(memory.contains(id));

        // Recording twice does not duplicate the entry.
        memory.record(id);
        assert_eq!(memory.len(), 1);

        assert!(!memory.contains(JobId([4, 3, 2, 1])));
    }

    #[test]
    fn test_ttl_purge() {
        let mut memory = JobMemory::with_ttl(Duration::from_millis(30));
        let id = JobId([7, 7, 7, 7]);
        memory.record(id);
        assert!(memory.contains(id));

        std::thread::sleep(Duration::from_millis(40));
        memory.purge();
        assert!(!memory.contains(id));
        assert!(memory.is_empty());
    }

    #[test]
    fn test_purge_keeps_live_entries() {
        let mut memory = JobMemory::with_ttl(Duration::from_secs(60));
        memory.record(JobId([1, 1, 1, 1]));
        memory.record(JobId([2, 2, 2, 2]));
        memory.purge();
        assert_eq!(memory.len(), 2);
    }
}
