// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool of TCP ports handed out to port-bound processes.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

use super::traits::{Result, RunnerError};

/// Ordered set of free ports drawn from a half-open range.
///
/// Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct PortPool {
    range: Range<u16>,
    free: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    /// Create a pool seeded with every port in `range`.
    pub fn new(range: Range<u16>) -> Self {
        Self {
            free: Arc::new(Mutex::new(range.clone().collect())),
            range,
        }
    }

    /// Remove and return the smallest free port.
    pub fn acquire(&self) -> Result<u16> {
        let port = self
            .free
            .lock()
            .pop_first()
            .ok_or(RunnerError::PortsExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;
        debug!(port, "Acquired port");
        Ok(port)
    }

    /// Return a previously acquired port to the pool.
    pub fn release(&self, port: u16) {
        debug_assert!(self.range.contains(&port), "port {port} outside pool range");
        self.free.lock().insert(port);
        debug!(port, "Released port");
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// The configured range.
    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_acquire_returns_smallest_port() {
        let pool = PortPool::new(17001..17004);
        assert_eq!(pool.acquire().unwrap(), 17001);
        assert_eq!(pool.acquire().unwrap(), 17002);
        pool.release(17001);
        assert_eq!(pool.acquire().unwrap(), 17001);
    }

    #[test]
    fn test_exhausted_pool_fails() {
        let pool = PortPool::new(17001..17002);
        pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, RunnerError::PortsExhausted { start: 17001, end: 17002 }));
    }

    #[test]
    fn test_empty_range_is_exhausted() {
        let pool = PortPool::new(17001..17001);
        assert!(pool.acquire().is_err());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_held_ports_are_never_handed_out_twice() {
        let pool = PortPool::new(20000..20050);
        let mut held = HashSet::new();
        for round in 0..200 {
            if round % 3 == 2 && !held.is_empty() {
                let port = *held.iter().next().unwrap();
                held.remove(&port);
                pool.release(port);
            } else if let Ok(port) = pool.acquire() {
                assert!(held.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(pool.available() + held.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_is_exclusive() {
        let pool = PortPool::new(21000..21100);
        let mut tasks = Vec::new();
        for _ in 0..100 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.acquire().unwrap() }));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert!(pool.acquire().is_err());
    }
}
