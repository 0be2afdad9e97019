use dashmap::DashMap;
use forkpool_core::WorkerId;
use std::sync::Arc;

/// Live workers of a launcher, by id.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    pids: Arc<DashMap<WorkerId, u32>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: WorkerId, pid: u32) {
        self.pids.insert(id, pid);
    }

    pub fn unregister(&self, id: WorkerId) -> Option<u32> {
        self.pids.remove(&id).map(|(_, pid)| pid)
    }

    pub fn get(&self, id: WorkerId) -> Option<u32> {
        self.pids.get(&id).map(|pid| *pid)
    }

    pub fn list(&self) -> Vec<(WorkerId, u32)> {
        let mut live: Vec<_> = self.pids.iter().map(|e| (*e.key(), *e.value())).collect();
        live.sort();
        live
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Empties the registry, returning what was in it.
    pub fn drain(&self) -> Vec<(WorkerId, u32)> {
        let live = self.list();
        for (id, _) in &live {
            self.pids.remove(id);
        }
        live
    }
}
