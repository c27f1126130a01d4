//! Global CPU/RAM accounting with scope-bound reservations.
//!
//! A reservation decrements the free counters and bumps the process counter
//! in one critical section. The matching release is bound to a
//! [`CancellationToken`]: when the token is cancelled the counters are
//! restored, exactly once, in a second critical section.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::SchedulerError;

/// Abstraction for spawning background work on a runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Free counters at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Free CPU units.
    pub cpu: u32,
    /// Free RAM units.
    pub ram: u32,
    /// Live reservations.
    pub processes: u32,
}

#[derive(Debug)]
struct Counters {
    cpu: u32,
    ram: u32,
    processes: u32,
}

/// Resource accountant enforcing a global CPU/RAM budget.
///
/// Readers (`is_doable`, `snapshot`) share the lock; reservations and
/// releases take it exclusively.
#[derive(Debug, Clone)]
pub struct Resources {
    total_cpu: u32,
    total_ram: u32,
    counters: Arc<RwLock<Counters>>,
}

impl Resources {
    /// Create an accountant with everything free.
    pub fn new(total_cpu: u32, total_ram: u32) -> Self {
        Self {
            total_cpu,
            total_ram,
            counters: Arc::new(RwLock::new(Counters {
                cpu: total_cpu,
                ram: total_ram,
                processes: 0,
            })),
        }
    }

    /// Total CPU budget.
    pub const fn total_cpu(&self) -> u32 {
        self.total_cpu
    }

    /// Total RAM budget.
    pub const fn total_ram(&self) -> u32 {
        self.total_ram
    }

    /// Check a request against the totals. Does not reserve anything.
    pub fn check(&self, cpu: u32, ram: u32) -> Result<(), SchedulerError> {
        if cpu == 0 || ram == 0 {
            return Err(SchedulerError::InvalidArgument(format!(
                "cpu and ram must be > 0, got cpu={cpu} ram={ram}"
            )));
        }
        if cpu > self.total_cpu {
            return Err(SchedulerError::ResourceCapacity(format!(
                "cpu {cpu} exceeds total {}",
                self.total_cpu
            )));
        }
        if ram > self.total_ram {
            return Err(SchedulerError::ResourceCapacity(format!(
                "ram {ram} exceeds total {}",
                self.total_ram
            )));
        }
        Ok(())
    }

    /// Whether the request fits the currently free counters.
    pub fn is_doable(&self, cpu: u32, ram: u32) -> bool {
        let counters = self.counters.read();
        cpu <= counters.cpu && ram <= counters.ram
    }

    /// Current free counters.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let counters = self.counters.read();
        ResourceSnapshot {
            cpu: counters.cpu,
            ram: counters.ram,
            processes: counters.processes,
        }
    }

    /// Reserve `cpu`/`ram` until `scope` is cancelled.
    ///
    /// The caller must have established `is_doable(cpu, ram)` under its own
    /// lock. Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when the free counters cannot cover the request, which means
    /// the admission invariant was broken.
    pub fn consume(&self, scope: &CancellationToken, cpu: u32, ram: u32) {
        {
            let mut counters = self.counters.write();
            assert!(
                cpu <= counters.cpu && ram <= counters.ram,
                "resource reservation without capacity: cpu {cpu}/{} ram {ram}/{}",
                counters.cpu,
                counters.ram
            );
            counters.cpu -= cpu;
            counters.ram -= ram;
            counters.processes += 1;
        }
        self.release_on(scope, cpu, ram, || {});
    }

    /// Check and reserve in a single critical section.
    ///
    /// Returns `false`, reserving nothing, when the request does not fit.
    pub fn try_consume(&self, scope: &CancellationToken, cpu: u32, ram: u32) -> bool {
        self.reserve(scope, cpu, ram, || {})
    }

    /// Like [`Self::try_consume`], running `on_release` once the counters
    /// have been restored.
    pub fn reserve<F>(&self, scope: &CancellationToken, cpu: u32, ram: u32, on_release: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut counters = self.counters.write();
            if cpu > counters.cpu || ram > counters.ram {
                return false;
            }
            counters.cpu -= cpu;
            counters.ram -= ram;
            counters.processes += 1;
        }
        self.release_on(scope, cpu, ram, on_release);
        true
    }

    fn release_on<F>(&self, scope: &CancellationToken, cpu: u32, ram: u32, on_release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        let scope = scope.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            {
                let mut counters = counters.write();
                counters.cpu += cpu;
                counters.ram += ram;
                counters.processes -= 1;
                tracing::debug!(
                    cpu = counters.cpu,
                    ram = counters.ram,
                    processes = counters.processes,
                    "released reservation"
                );
            }
            on_release();
        });
    }
}
