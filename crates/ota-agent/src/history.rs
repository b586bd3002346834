//! In-memory record of upgrade cycles
//!
//! The controller writes, the status API reads.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cycle::{CyclePhase, UpgradeCycle};

struct Inner {
    active: HashMap<String, UpgradeCycle>,
    finished: VecDeque<UpgradeCycle>,
    capacity: usize,
}

/// Shared cycle history
#[derive(Clone)]
pub struct CycleHistory {
    inner: Arc<Mutex<Inner>>,
}

/// Cycle counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CycleHistory {
    /// Create a history keeping at most `capacity` finished cycles
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                active: HashMap::new(),
                finished: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            })),
        }
    }

    /// Publish the current state of an in-flight cycle
    pub async fn update_active(&self, cycle: &UpgradeCycle) {
        let mut inner = self.inner.lock().await;
        inner.active.insert(cycle.module.clone(), cycle.clone());
    }

    /// Move a terminal cycle from active to finished
    pub async fn finish(&self, cycle: UpgradeCycle) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(&cycle.module);

        if inner.finished.len() == inner.capacity {
            inner.finished.pop_front();
        }
        debug!(
            "Recorded cycle {} for module {}: {}",
            cycle.cycle_id, cycle.module, cycle.phase
        );
        inner.finished.push_back(cycle);
    }

    pub async fn active(&self, module: &str) -> Option<UpgradeCycle> {
        self.inner.lock().await.active.get(module).cloned()
    }

    /// Most recent finished cycle for a module
    pub async fn last_finished(&self, module: &str) -> Option<UpgradeCycle> {
        self.inner
            .lock()
            .await
            .finished
            .iter()
            .rev()
            .find(|c| c.module == module)
            .cloned()
    }

    /// In-flight cycles, ordered by module
    pub async fn active_cycles(&self) -> Vec<UpgradeCycle> {
        let mut cycles: Vec<_> = self.inner.lock().await.active.values().cloned().collect();
        cycles.sort_by(|a, b| a.module.cmp(&b.module));
        cycles
    }

    /// Finished cycles, newest first
    pub async fn finished(&self) -> Vec<UpgradeCycle> {
        self.inner.lock().await.finished.iter().rev().cloned().collect()
    }

    pub async fn stats(&self) -> HistoryStats {
        let inner = self.inner.lock().await;
        let succeeded = inner
            .finished
            .iter()
            .filter(|c| c.phase == CyclePhase::Succeeded)
            .count();

        HistoryStats {
            active: inner.active.len(),
            succeeded,
            failed: inner.finished.len() - succeeded,
        }
    }
}
