//! Reachability of the accounting backend.
//!
//! The lock fallback uses accounting reachability to tell a lost origin
//! apart from a general outage: if the accounting backend is also
//! unreachable, the local cluster is probably the one cut off and must not
//! start federated jobs on its own.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

#[async_trait]
pub trait AccountingProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe with a fixed, switchable answer.
#[derive(Debug)]
pub struct StaticAccountingProbe {
    reachable: AtomicBool,
}

impl StaticAccountingProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }
}

impl Default for StaticAccountingProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl AccountingProbe for StaticAccountingProbe {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }
}
