//! Forward-progress prefetch: keep upcoming node documents built.
//!
//! When a learner makes forward progress on a ready path, the trigger
//! looks a few nodes ahead; if documents are missing and the debounce
//! gap has passed, it asks the job service to build them. Probe
//! selection rides along under its own hourly budget. Enqueueing happens
//! after the page commits and is always best-effort.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::catalog::{Path, PathStatus};
use crate::config::PrefetchConfig;
use crate::error::Result;
use crate::ids::NodeId;
use crate::services::{DebouncedJob, JobKind};
use crate::state::PathRun;
use crate::storage::SqliteRuntimeStore;

/// Decides prefetch and probe-selection side jobs.
#[derive(Debug, Clone)]
pub struct PrefetchTrigger {
    config: PrefetchConfig,
    progress_conf_min: f64,
}

impl PrefetchTrigger {
    /// Create a trigger with the given tunables.
    pub fn new(config: PrefetchConfig, progress_conf_min: f64) -> Self {
        Self {
            config,
            progress_conf_min,
        }
    }

    /// Evaluate prefetch for a (path, node) forward-progress candidate.
    ///
    /// Stamps the debounce bookkeeping on `path_run.runtime`; the caller
    /// persists the run inside the page transaction and enqueues the
    /// returned jobs after commit.
    pub fn evaluate(
        &self,
        store: &SqliteRuntimeStore,
        path: &Path,
        path_run: &mut PathRun,
        node_id: NodeId,
        node_completed: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<DebouncedJob>> {
        if path.material_set_id.is_none() || path.status != PathStatus::Ready {
            return Ok(Vec::new());
        }

        let progress_ok = node_completed || self.progressing_confidently(path_run);
        if !progress_ok {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();

        let gap_ok = match path_run.runtime.last_prefetch_at {
            None => true,
            Some(last) => {
                (now - last).num_seconds() as f64 / 60.0 >= self.config.min_gap_minutes
            }
        };
        if gap_ok && self.lookahead_has_missing_docs(store, path, node_id)? {
            path_run.runtime.last_prefetch_at = Some(now);
            jobs.push(
                DebouncedJob::new(JobKind::NodeDocProgressiveBuild, path_run.user_id)
                    .with_path(path.id)
                    .with_node(node_id),
            );
        }

        if self.probe_budget_allows(path_run, now) {
            path_run.runtime.probe_selects_in_window =
                path_run.runtime.probe_selects_in_window.saturating_add(1);
            jobs.push(
                DebouncedJob::new(JobKind::DocProbeSelect, path_run.user_id)
                    .with_path(path.id)
                    .with_node(node_id),
            );
        }

        if !jobs.is_empty() {
            debug!(user_id = %path_run.user_id, node_id = %node_id, jobs = jobs.len(), "prefetch jobs planned");
        }
        Ok(jobs)
    }

    fn progressing_confidently(&self, path_run: &PathRun) -> bool {
        let Some(signal) = path_run.runtime.latest_signal() else {
            return false;
        };
        if signal.progress_state.as_deref() != Some("progressing") {
            return false;
        }
        signal
            .progress_confidence
            .map(|c| c >= self.progress_conf_min)
            .unwrap_or(true)
    }

    fn lookahead_has_missing_docs(
        &self,
        store: &SqliteRuntimeStore,
        path: &Path,
        node_id: NodeId,
    ) -> Result<bool> {
        let nodes = store.path_nodes_by_path(path.id)?;
        let Some(current) = nodes.iter().position(|n| n.id == node_id) else {
            return Ok(false);
        };
        for node in nodes
            .iter()
            .skip(current + 1)
            .take(self.config.lookahead as usize)
        {
            if !store.node_document_exists(node.id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hourly probe-selection budget, tracked on the path runtime blob.
    fn probe_budget_allows(&self, path_run: &mut PathRun, now: DateTime<Utc>) -> bool {
        if self.config.probe_per_hour == 0 {
            return false;
        }
        let stale = path_run
            .runtime
            .probe_window_started_at
            .map(|start| now - start > Duration::hours(1))
            .unwrap_or(true);
        if stale {
            path_run.runtime.probe_window_started_at = Some(now);
            path_run.runtime.probe_selects_in_window = 0;
        }
        path_run.runtime.probe_selects_in_window < self.config.probe_per_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PathNode;
    use crate::event::{Event, EventType};
    use crate::ids::{PathId, UserId};

    fn seeded_store(path: &Path, node_count: u32, docs_built: u32) -> (SqliteRuntimeStore, Vec<NodeId>) {
        let store = SqliteRuntimeStore::in_memory().unwrap();
        store.upsert_path(path).unwrap();
        let mut nodes = Vec::new();
        for position in 0..node_count {
            let node = PathNode {
                id: NodeId::new(),
                path_id: path.id,
                position,
                title: format!("node {}", position),
            };
            store.upsert_path_node(&node).unwrap();
            if position < docs_built {
                store
                    .upsert_node_document(&crate::document::NodeDocument::new(node.id, vec![]))
                    .unwrap();
            }
            nodes.push(node.id);
        }
        (store, nodes)
    }

    fn progressing_run(path_id: PathId, now: DateTime<Utc>) -> PathRun {
        let mut run = PathRun::not_started(UserId::new(), path_id, now);
        let event = Event::new(run.user_id, EventType::BlockRead, now)
            .with_session("s1")
            .with_data("progress_state", "progressing")
            .with_data("progress_confidence", 0.9);
        run.runtime.note_signal(&event, now);
        run
    }

    #[test]
    fn test_prefetch_enqueues_build_for_missing_docs() {
        let now = Utc::now();
        let path = Path::new(PathId::new()).with_material_set("ms-1");
        let (store, nodes) = seeded_store(&path, 4, 1);
        let mut run = progressing_run(path.id, now);
        let trigger = PrefetchTrigger::new(PrefetchConfig::default(), 0.5);

        let jobs = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, now)
            .unwrap();
        assert!(jobs.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));
        assert!(run.runtime.last_prefetch_at.is_some());
    }

    #[test]
    fn test_prefetch_skips_when_docs_exist() {
        let now = Utc::now();
        let path = Path::new(PathId::new()).with_material_set("ms-1");
        let (store, nodes) = seeded_store(&path, 4, 4);
        let mut run = progressing_run(path.id, now);
        let trigger = PrefetchTrigger::new(PrefetchConfig::default(), 0.5);

        let jobs = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, now)
            .unwrap();
        assert!(!jobs.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));
    }

    #[test]
    fn test_prefetch_requires_material_set_and_ready_path() {
        let now = Utc::now();
        let bare = Path::new(PathId::new());
        let (store, nodes) = seeded_store(&bare, 3, 0);
        let mut run = progressing_run(bare.id, now);
        let trigger = PrefetchTrigger::new(PrefetchConfig::default(), 0.5);
        assert!(trigger
            .evaluate(&store, &bare, &mut run, nodes[0], false, now)
            .unwrap()
            .is_empty());

        let mut building = Path::new(PathId::new()).with_material_set("ms-1");
        building.status = PathStatus::Building;
        let (store, nodes) = seeded_store(&building, 3, 0);
        let mut run = progressing_run(building.id, now);
        assert!(trigger
            .evaluate(&store, &building, &mut run, nodes[0], false, now)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_prefetch_requires_confident_progress_or_completion() {
        let now = Utc::now();
        let path = Path::new(PathId::new()).with_material_set("ms-1");
        let (store, nodes) = seeded_store(&path, 3, 0);
        let trigger = PrefetchTrigger::new(PrefetchConfig::default(), 0.5);

        // Low-confidence progress is not enough
        let mut run = PathRun::not_started(UserId::new(), path.id, now);
        let weak = Event::new(run.user_id, EventType::BlockRead, now)
            .with_session("s1")
            .with_data("progress_state", "progressing")
            .with_data("progress_confidence", 0.2);
        run.runtime.note_signal(&weak, now);
        assert!(trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, now)
            .unwrap()
            .is_empty());

        // Node completion overrides the progress signal
        let jobs = trigger
            .evaluate(&store, &path, &mut run, nodes[0], true, now)
            .unwrap();
        assert!(jobs.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));
    }

    #[test]
    fn test_prefetch_min_gap_debounce() {
        let now = Utc::now();
        let path = Path::new(PathId::new()).with_material_set("ms-1");
        let (store, nodes) = seeded_store(&path, 3, 0);
        let mut run = progressing_run(path.id, now);
        let trigger = PrefetchTrigger::new(PrefetchConfig::default(), 0.5);

        let first = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, now)
            .unwrap();
        assert!(first.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));

        // Two minutes later: inside the gap, no build job
        let soon = now + Duration::minutes(2);
        let second = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, soon)
            .unwrap();
        assert!(!second.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));

        let later = now + Duration::minutes(15);
        let third = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, later)
            .unwrap();
        assert!(third.iter().any(|j| j.kind == JobKind::NodeDocProgressiveBuild));
    }

    #[test]
    fn test_probe_budget_caps_per_hour() {
        let now = Utc::now();
        let path = Path::new(PathId::new()).with_material_set("ms-1");
        let (store, nodes) = seeded_store(&path, 3, 3);
        let mut run = progressing_run(path.id, now);
        let trigger = PrefetchTrigger::new(
            PrefetchConfig {
                probe_per_hour: 2,
                ..PrefetchConfig::default()
            },
            0.5,
        );

        let mut probe_count = 0;
        for i in 0..4 {
            let at = now + Duration::minutes(i);
            let jobs = trigger
                .evaluate(&store, &path, &mut run, nodes[0], false, at)
                .unwrap();
            probe_count += jobs
                .iter()
                .filter(|j| j.kind == JobKind::DocProbeSelect)
                .count();
        }
        assert_eq!(probe_count, 2);

        // The budget refills after the window rolls over
        let next_window = now + Duration::hours(2);
        let jobs = trigger
            .evaluate(&store, &path, &mut run, nodes[0], false, next_window)
            .unwrap();
        assert!(jobs.iter().any(|j| j.kind == JobKind::DocProbeSelect));
    }
}
