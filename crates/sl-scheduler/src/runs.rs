//! Tracked runs and the worker slots they occupy.

use sl_types::{RunState, SweepRun};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Every run the scheduler is currently tracking, keyed by run id.
///
/// A worker is busy while some tracked run bound to it is not DEAD. UNKNOWN
/// runs keep their slot until a later reconciliation resolves them, so a
/// worker is never handed to a second run while the first may still be live.
#[derive(Debug, Clone)]
pub struct RunTable {
    num_workers: usize,
    runs: BTreeMap<String, SweepRun>,
}

impl RunTable {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            runs: BTreeMap::new(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Start tracking a run. Returns `false` and leaves the table untouched
    /// when the id is already tracked.
    pub fn register(&mut self, run: SweepRun) -> bool {
        if self.runs.contains_key(&run.id) {
            debug!(run_id = %run.id, "run already tracked");
            return false;
        }
        self.runs.insert(run.id.clone(), run);
        true
    }

    pub fn get(&self, run_id: &str) -> Option<&SweepRun> {
        self.runs.get(run_id)
    }

    pub fn get_mut(&mut self, run_id: &str) -> Option<&mut SweepRun> {
        self.runs.get_mut(run_id)
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn set_state(&mut self, run_id: &str, state: RunState) -> bool {
        match self.runs.get_mut(run_id) {
            Some(run) => {
                run.state = state;
                true
            }
            None => false,
        }
    }

    /// Drop every DEAD run, returning the runs removed.
    pub fn remove_dead(&mut self) -> Vec<SweepRun> {
        let dead: Vec<String> = self
            .runs
            .values()
            .filter(|run| run.state == RunState::Dead)
            .map(|run| run.id.clone())
            .collect();
        dead.iter().filter_map(|run_id| self.runs.remove(run_id)).collect()
    }

    pub fn busy_workers(&self) -> BTreeSet<usize> {
        self.runs
            .values()
            .filter(|run| run.state != RunState::Dead)
            .map(|run| run.worker_id)
            .collect()
    }

    /// Worker ids not held by any live run, in ascending order.
    pub fn available_workers(&self) -> Vec<usize> {
        let busy = self.busy_workers();
        (0..self.num_workers).filter(|id| !busy.contains(id)).collect()
    }

    /// Ids of runs the reconciler should query: everything not yet DEAD.
    pub fn pending_ids(&self) -> Vec<String> {
        self.runs
            .values()
            .filter(|run| run.state != RunState::Dead)
            .map(|run| run.id.clone())
            .collect()
    }

    /// Liveness per run as sent with agent heartbeats.
    pub fn liveness(&self) -> BTreeMap<String, bool> {
        self.runs
            .values()
            .map(|run| (run.id.clone(), run.state == RunState::Alive))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SweepRun> {
        self.runs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::RunArgs;

    fn run(id: &str, worker: usize, state: RunState) -> SweepRun {
        SweepRun::new(id, worker, RunArgs::new()).with_state(state)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut table = RunTable::new(2);
        assert!(table.register(run("a", 0, RunState::Alive)));
        assert!(!table.register(run("a", 1, RunState::Alive)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a").unwrap().worker_id, 0);
    }

    #[test]
    fn workers_partition() {
        let mut table = RunTable::new(8);
        table.register(run("alive", 0, RunState::Alive));
        table.register(run("unknown", 3, RunState::Unknown));
        table.register(run("dead", 5, RunState::Dead));

        let busy = table.busy_workers();
        let available = table.available_workers();
        assert_eq!(busy.into_iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(available, vec![1, 2, 4, 5, 6, 7]);
        assert_eq!(table.busy_workers().len() + available.len(), 8);
    }

    #[test]
    fn remove_dead_frees_slots() {
        let mut table = RunTable::new(2);
        table.register(run("a", 0, RunState::Alive));
        table.register(run("b", 1, RunState::Alive));
        assert!(table.available_workers().is_empty());

        assert!(table.set_state("b", RunState::Dead));
        assert!(!table.set_state("missing", RunState::Dead));
        let removed = table.remove_dead();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "b");
        assert!(!table.contains("b"));
        assert_eq!(table.available_workers(), vec![1]);
        assert_eq!(table.pending_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn liveness_reports_only_alive_as_true() {
        let mut table = RunTable::new(2);
        table.register(run("a", 0, RunState::Alive));
        table.register(run("b", 1, RunState::Unknown));
        let liveness = table.liveness();
        assert_eq!(liveness["a"], true);
        assert_eq!(liveness["b"], false);
    }
}
