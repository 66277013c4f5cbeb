//! Pool of local ports available for passive DCC listeners.
//!
//! The number of configured ports bounds how many passive transfers can
//! run in parallel. Ports are handed out as [`PortLease`]s that return
//! themselves to the pool on drop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::IteratorRandom;
use tracing::{debug, warn};

use crate::error::DataChannelError;

/// Candidate passive ports and the subset currently bound.
#[derive(Debug)]
pub struct PortPool {
    configured: Vec<u16>,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// Creates a pool over `ports`. Duplicates are ignored.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut configured: Vec<u16> = Vec::new();
        for port in ports {
            if !configured.contains(&port) {
                configured.push(port);
            }
        }
        Self {
            configured,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    fn in_use(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Draws a random free port, or `None` when every port is held.
    pub fn acquire(&self) -> Option<u16> {
        let mut in_use = self.in_use();
        let port = self
            .configured
            .iter()
            .copied()
            .filter(|p| !in_use.contains(p))
            .choose(&mut rand::thread_rng())?;
        in_use.insert(port);
        debug!(port, held = in_use.len(), "passive port acquired");
        Some(port)
    }

    /// Returns `port` to the pool.
    ///
    /// Releasing a port that is not held leaves the pool untouched and
    /// returns `false`.
    pub fn release(&self, port: u16) -> bool {
        let released = self.in_use().remove(&port);
        if released {
            debug!(port, "passive port released");
        } else {
            warn!(port, "release of a passive port that was not held");
        }
        released
    }

    /// Like [`acquire`](Self::acquire), but the port is released when the
    /// returned lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, DataChannelError> {
        let port = self.acquire().ok_or(DataChannelError::PortsExhausted)?;
        Ok(PortLease {
            pool: Arc::clone(self),
            port,
        })
    }

    /// Number of ports that can still be acquired.
    pub fn available(&self) -> usize {
        let in_use = self.in_use();
        self.configured
            .iter()
            .filter(|p| !in_use.contains(p))
            .count()
    }

    /// Whether `port` is currently held.
    pub fn is_held(&self, port: u16) -> bool {
        self.in_use().contains(&port)
    }

    /// All configured ports.
    pub fn configured(&self) -> &[u16] {
        &self.configured
    }
}

/// An acquired passive port, released exactly once on drop.
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_never_returns_held_port() {
        let pool = PortPool::new([5001, 5002, 5003]);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let port = pool.acquire().unwrap();
            assert!(pool.configured().contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn exhaustion_until_release() {
        let pool = PortPool::new([6000]);
        assert_eq!(pool.acquire(), Some(6000));
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.acquire(), None);

        assert!(pool.release(6000));
        assert_eq!(pool.acquire(), Some(6000));
    }

    #[test]
    fn double_release_does_not_corrupt() {
        let pool = PortPool::new([7000, 7001]);
        let port = pool.acquire().unwrap();
        assert!(pool.release(port));
        assert!(!pool.release(port));
        assert!(!pool.release(9999));

        assert_eq!(pool.available(), 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn duplicates_are_collapsed() {
        let pool = PortPool::new([8000, 8000, 8001]);
        assert_eq!(pool.configured(), &[8000, 8001]);
    }

    #[test]
    fn empty_pool_is_exhausted() {
        let pool = PortPool::new(Vec::new());
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn lease_releases_on_drop() {
        let pool = Arc::new(PortPool::new([9100]));
        {
            let lease = pool.lease().unwrap();
            assert_eq!(lease.port(), 9100);
            assert!(pool.is_held(9100));
            assert!(matches!(pool.lease(), Err(DataChannelError::PortsExhausted)));
        }
        assert!(!pool.is_held(9100));
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn concurrent_acquire_is_exclusive() {
        use std::thread;

        let pool = Arc::new(PortPool::new(10_000..10_050));
        let mut handles = vec![];
        for _ in 0..10 {
            let p = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut mine = Vec::new();
                while let Some(port) = p.acquire() {
                    mine.push(port);
                }
                mine
            }));
        }

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }
}
