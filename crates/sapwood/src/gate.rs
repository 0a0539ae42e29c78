//! Mutual-exclusion gate for pipelines sharing an external project.
//!
//! Pipelines register as users of the external projects their
//! external-transform tasks run against. Before such a pipeline runs, the
//! gate checks whether any *other* user of one of its projects is running;
//! if so the whole run is skipped. The check and marking the run as running
//! are one step, so two runs racing for a project cannot both proceed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Pipeline-run state, shared across pipelines.
pub trait RunStateService: Send + Sync {
    /// Record `pipeline` as a user of `project`.
    fn register(&self, project: &str, pipeline: &str);

    /// Every pipeline registered against `project`.
    fn pipelines_for(&self, project: &str) -> BTreeSet<String>;

    /// Pipelines registered against `project` that are currently running.
    fn running_pipelines(&self, project: &str) -> BTreeSet<String>;

    fn mark_running(&self, pipeline: &str);

    fn mark_finished(&self, pipeline: &str);

    /// Mark `pipeline` running unless another user of one of `projects` is
    /// running, in one step. Fails with the conflicting pipelines.
    fn try_acquire(&self, pipeline: &str, projects: &BTreeSet<String>) -> Result<(), BTreeSet<String>>;
}

/// Process-local [`RunStateService`].
#[derive(Debug, Default)]
pub struct InMemoryRunState {
    users: RwLock<BTreeMap<String, BTreeSet<String>>>,
    running: RwLock<BTreeSet<String>>,
}

impl InMemoryRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, pipeline: &str) -> bool {
        read(&self.running).contains(pipeline)
    }
}

impl RunStateService for InMemoryRunState {
    fn register(&self, project: &str, pipeline: &str) {
        write(&self.users)
            .entry(project.to_string())
            .or_default()
            .insert(pipeline.to_string());
    }

    fn pipelines_for(&self, project: &str) -> BTreeSet<String> {
        read(&self.users).get(project).cloned().unwrap_or_default()
    }

    fn running_pipelines(&self, project: &str) -> BTreeSet<String> {
        let running = read(&self.running);
        self.pipelines_for(project)
            .into_iter()
            .filter(|p| running.contains(p))
            .collect()
    }

    fn mark_running(&self, pipeline: &str) {
        write(&self.running).insert(pipeline.to_string());
    }

    fn mark_finished(&self, pipeline: &str) {
        write(&self.running).remove(pipeline);
    }

    fn try_acquire(&self, pipeline: &str, projects: &BTreeSet<String>) -> Result<(), BTreeSet<String>> {
        let mut running = write(&self.running);
        let users = read(&self.users);
        let conflicts: BTreeSet<String> = projects
            .iter()
            .filter_map(|project| users.get(project))
            .flatten()
            .filter(|p| p.as_str() != pipeline && running.contains(p.as_str()))
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        running.insert(pipeline.to_string());
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Gate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Not yet evaluated.
    Check,
    /// No conflicting pipeline is running.
    Proceed,
    /// A conflicting pipeline is running; no task of this run executes.
    Skip,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateState::Check => "check",
            GateState::Proceed => "proceed",
            GateState::Skip => "skip",
        })
    }
}

/// Branch decision evaluated once per pipeline run.
#[derive(Debug, Clone)]
pub struct MutualExclusionGate {
    pipeline: String,
    projects: BTreeSet<String>,
    state: GateState,
}

impl MutualExclusionGate {
    pub fn new(pipeline: impl Into<String>, projects: BTreeSet<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            projects,
            state: GateState::Check,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn projects(&self) -> &BTreeSet<String> {
        &self.projects
    }

    /// Leave `Check` for `Proceed` or `Skip`. On `Proceed` the pipeline is
    /// already marked running. Later calls return the decision already
    /// taken.
    pub fn evaluate(&mut self, run_state: &dyn RunStateService) -> GateState {
        if self.state != GateState::Check {
            return self.state;
        }

        for project in &self.projects {
            info!(
                pipeline = %self.pipeline,
                project = %project,
                consulted = ?run_state.pipelines_for(project),
                "checking pipelines sharing external project"
            );
        }

        self.state = match run_state.try_acquire(&self.pipeline, &self.projects) {
            Ok(()) => GateState::Proceed,
            Err(conflicts) => {
                info!(pipeline = %self.pipeline, conflicts = ?conflicts, "skipping run");
                GateState::Skip
            }
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn projects(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_running_pipelines() {
        let state = InMemoryRunState::new();
        state.register("analytics", "a");
        state.register("analytics", "b");
        state.register("finance", "c");
        state.mark_running("b");
        state.mark_running("c");

        assert_eq!(state.pipelines_for("analytics"), projects(&["a", "b"]));
        assert_eq!(state.running_pipelines("analytics"), projects(&["b"]));
        assert!(state.running_pipelines("unknown").is_empty());

        state.mark_finished("b");
        assert!(state.running_pipelines("analytics").is_empty());
    }

    #[test]
    fn test_gate_proceeds_when_nothing_running() {
        let state = InMemoryRunState::new();
        state.register("analytics", "a");
        state.register("analytics", "b");

        let mut gate = MutualExclusionGate::new("a", projects(&["analytics"]));
        assert_eq!(gate.state(), GateState::Check);
        assert_eq!(gate.evaluate(&state), GateState::Proceed);
        assert!(state.is_running("a"));

        let mut other = MutualExclusionGate::new("b", projects(&["analytics"]));
        assert_eq!(other.evaluate(&state), GateState::Skip);
        assert!(!state.is_running("b"));
    }

    #[test]
    fn test_racing_runs_cannot_both_proceed() {
        let state = InMemoryRunState::new();
        let pipelines = ["a", "b", "c", "d"];
        for pipeline in pipelines {
            state.register("analytics", pipeline);
        }

        let barrier = Barrier::new(pipelines.len());
        let decisions: Vec<GateState> = thread::scope(|scope| {
            let handles: Vec<_> = pipelines
                .iter()
                .map(|pipeline| {
                    let (state, barrier) = (&state, &barrier);
                    scope.spawn(move || {
                        let mut gate = MutualExclusionGate::new(*pipeline, projects(&["analytics"]));
                        barrier.wait();
                        gate.evaluate(state)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let proceeded = decisions.iter().filter(|d| **d == GateState::Proceed).count();
        assert_eq!(proceeded, 1);
        assert_eq!(state.running_pipelines("analytics").len(), 1);
    }

    #[test]
    fn test_gate_skips_when_other_pipeline_running() {
        let state = InMemoryRunState::new();
        state.register("analytics", "a");
        state.register("analytics", "b");
        state.mark_running("b");

        let mut gate = MutualExclusionGate::new("a", projects(&["analytics"]));
        assert_eq!(gate.evaluate(&state), GateState::Skip);

        // The decision is taken once per run.
        state.mark_finished("b");
        assert_eq!(gate.evaluate(&state), GateState::Skip);
    }

    #[test]
    fn test_gate_ignores_itself() {
        let state = InMemoryRunState::new();
        state.register("analytics", "a");
        state.mark_running("a");

        let mut gate = MutualExclusionGate::new("a", projects(&["analytics"]));
        assert_eq!(gate.evaluate(&state), GateState::Proceed);
    }
}
