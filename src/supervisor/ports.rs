//! Thread-safe port pool over an inclusive range.
//!
//! Reservations are keyed by workflow id and idempotent: reserving twice for
//! the same id returns the same port. Release happens through the returned
//! handle, which verifies the allocation still belongs to its id so a stale
//! double-release can never free someone else's port.

use crate::error::{ProcessError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Pool {
    /// workflow id → port
    by_id: HashMap<String, u16>,
    /// port → workflow id
    by_port: HashMap<u16, String>,
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    pool: Arc<Mutex<Pool>>,
}

/// Releases the reservation when invoked. Idempotent; dropping without
/// calling [`ReleaseHandle::release`] leaks the port deliberately (the
/// supervisor releases only on confirmed process exit).
#[derive(Debug)]
pub struct ReleaseHandle {
    workflow_id: String,
    port: u16,
    pool: Arc<Mutex<Pool>>,
}

impl ReleaseHandle {
    pub fn release(self) {
        let mut pool = self.pool.lock();
        // Only release if this allocation still belongs to our id.
        if pool.by_id.get(&self.workflow_id) == Some(&self.port) {
            pool.by_id.remove(&self.workflow_id);
            pool.by_port.remove(&self.port);
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PortAllocator {
    /// Inclusive range `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            pool: Arc::new(Mutex::new(Pool::default())),
        }
    }

    /// Reserve a port for `workflow_id`. Same id reserves the same port.
    pub fn reserve(&self, workflow_id: &str) -> Result<(u16, ReleaseHandle)> {
        let mut pool = self.pool.lock();
        if let Some(port) = pool.by_id.get(workflow_id).copied() {
            return Ok((port, self.handle(workflow_id, port)));
        }

        for port in self.start..=self.end {
            if !pool.by_port.contains_key(&port) {
                pool.by_id.insert(workflow_id.to_string(), port);
                pool.by_port.insert(port, workflow_id.to_string());
                return Ok((port, self.handle(workflow_id, port)));
            }
        }
        Err(ProcessError::PortsExhausted {
            start: self.start,
            end: self.end,
        }
        .into())
    }

    fn handle(&self, workflow_id: &str, port: u16) -> ReleaseHandle {
        ReleaseHandle {
            workflow_id: workflow_id.to_string(),
            port,
            pool: Arc::clone(&self.pool),
        }
    }

    pub fn in_use(&self) -> usize {
        self.pool.lock().by_port.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn reserve_is_idempotent_per_workflow() {
        let allocator = PortAllocator::new(9000, 9001);
        let (a1, _h1) = allocator.reserve("WORKER.1").expect("first");
        let (a2, _h2) = allocator.reserve("WORKER.1").expect("repeat");
        assert_eq!(a1, a2);
        assert_eq!(allocator.in_use(), 1);
    }

    #[test]
    fn exhaustion_then_reuse_after_release() {
        let allocator = PortAllocator::new(9000, 9001);
        let (p1, h1) = allocator.reserve("WORKER.1").expect("first");
        let (p2, _h2) = allocator.reserve("WORKER.2").expect("second");
        assert_ne!(p1, p2);

        let error = allocator.reserve("WORKER.3").expect_err("pool is full");
        assert!(matches!(
            error,
            Error::Process(ProcessError::PortsExhausted { start: 9000, end: 9001 })
        ));

        h1.release();
        let (p3, _h3) = allocator.reserve("WORKER.3").expect("freed port");
        assert_eq!(p3, p1);
    }

    #[test]
    fn stale_release_does_not_free_new_owner() {
        let allocator = PortAllocator::new(9000, 9000);
        let (_p, stale) = allocator.reserve("WORKER.1").expect("first");

        // The workflow re-reserves (idempotent) and holds a newer handle.
        let (_p, current) = allocator.reserve("WORKER.1").expect("repeat");
        stale.release();
        // First release removed the allocation; the port went back.
        assert_eq!(allocator.in_use(), 0);

        // A different workflow takes it; the old handle must not free it.
        let (_p, _h) = allocator.reserve("WORKER.2").expect("new owner");
        current.release();
        assert_eq!(allocator.in_use(), 1, "WORKER.2 keeps its reservation");
    }

    #[test]
    fn no_two_workflows_share_a_port() {
        let allocator = PortAllocator::new(9000, 9005);
        let mut seen = std::collections::HashSet::new();
        for n in 0..6 {
            let (port, _h) = allocator.reserve(&format!("W.{n}")).expect("reserve");
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }
}
