//! Registry of services browsers watching this agent.
//!
//! Any remote that pings us (or sends a kill/stop) gets periodic status
//! broadcasts until it goes quiet for the timeout window.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A browser is dropped after this much silence.
pub const BROWSER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BrowserRegistry {
    timeout: Duration,
    entries: Vec<(SocketAddr, Instant)>,
}

impl BrowserRegistry {
    pub fn new() -> Self {
        Self::with_timeout(BROWSER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Vec::new(),
        }
    }

    /// Insert or refresh an observer.
    pub fn observe(&mut self, addr: SocketAddr) {
        let now = Instant::now();
        if let Some(entry) = self.entries.iter_mut().find(|(a, _)| *a == addr) {
            entry.1 = now;
        } else {
            self.entries.push((addr, now));
        }
    }

    /// Drop observers that have been silent past the timeout.
    pub fn purge(&mut self) {
        let timeout = self.timeout;
        let now = Instant::now();
        self.entries
            .retain(|(_, last)| now.duration_since(*last) < timeout);
    }

    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.entries.iter().map(|(a, _)| *a)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for BrowserRegistry {
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

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_observe_and_refresh() {
        let mut registry = BrowserRegistry::new();
        registry.observe(addr(1000));
        registry.observe(addr(1001));
        registry.observe(addr(1000)); // refresh, not a new entry
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_silent_entries_purged() {
        let mut registry = BrowserRegistry::with_timeout(Duration::from_millis(25));
        registry.observe(addr(2000));
        std::thread::sleep(Duration::from_millis(15));
        registry.observe(addr(2001));
        std::thread::sleep(Duration::from_millis(15));

        registry.purge();
        let remaining: Vec<_> = registry.addrs().collect();
        assert_eq!(remaining, vec![addr(2001)]);
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let mut registry = BrowserRegistry::with_timeout(Duration::from_millis(30));
        registry.observe(addr(3000));
        std::thread::sleep(Duration::from_millis(20));
        registry.observe(addr(3000));
        std::thread::sleep(Duration::from_millis(20));

        registry.purge();
        assert_eq!(registry.len(), 1);
    }
}
