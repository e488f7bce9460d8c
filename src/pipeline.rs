//! The per-user runtime-update pipeline.
//!
//! A `runtime_update` job claims events strictly after the persisted
//! cursor and applies them page by page, one transaction per page:
//! idempotency check, context resolution, state-machine updates,
//! planner, misconception resolution, transition insert, cursor
//! advance. Side effects (push notification, prefetch and policy jobs)
//! fire after the page commits and are best-effort.
//!
//! The job service guarantees single-writer-per-user; within one job,
//! processing is strictly sequential in `(created_at, id)` order.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::Path;
use crate::config::RuntimeConfig;
use crate::error::{Error, JobStage, Result};
use crate::event::{Event, EventType};
use crate::ids::{ConceptId, PathId, UserId};
use crate::misconception::MisconceptionResolver;
use crate::planner::RuntimePlanner;
use crate::prefetch::PrefetchTrigger;
use crate::readiness::ReadinessEvaluator;
use crate::services::{DebouncedJob, JobService, PromptPayload, RuntimeNotifier};
use crate::state::{NodeRun, NodeRunState, PathRun, PathRunTransition};
use crate::storage::SqliteRuntimeStore;

/// Cursor consumer name of this pipeline.
pub const RUNTIME_UPDATE_CONSUMER: &str = "runtime_update";

/// A runtime-update job claim.
#[derive(Debug, Clone)]
pub struct RuntimeUpdateJob {
    /// Owning user; absent means the job is malformed
    pub user_id: Option<UserId>,
    /// What triggered the job (event kind, cron, manual)
    pub trigger: String,
}

impl RuntimeUpdateJob {
    /// Create a job for a user.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            trigger: String::new(),
        }
    }

    /// Set the trigger.
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = trigger.into();
        self
    }
}

/// What a pipeline run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Events applied (transitions inserted)
    pub processed: u64,
    /// Pages committed
    pub pages: u32,
    /// Prompts emitted
    pub prompts_emitted: u32,
    /// Wall time of the run, milliseconds
    pub duration_ms: u64,
    /// Whether the run stopped early on cancellation
    pub canceled: bool,
}

/// Cooperative cancellation: a shutdown flag plus an optional deadline.
/// Checked between pages; the in-flight page always completes or rolls
/// back whole.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
}

impl Cancellation {
    /// A token that never fires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested or the deadline passed.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.map(|d| Utc::now() >= d).unwrap_or(false)
    }
}

/// Page application result, handed out of the transaction.
struct PageEffects {
    processed: u64,
    prompts: Vec<PromptPayload>,
    side_jobs: Vec<DebouncedJob>,
}

/// The per-user event pipeline driver.
pub struct PipelineDriver {
    store: Arc<SqliteRuntimeStore>,
    config: RuntimeConfig,
    planner: RuntimePlanner,
    prefetch: PrefetchTrigger,
    misconceptions: MisconceptionResolver,
    jobs: Option<Arc<dyn JobService>>,
    notifier: Option<Arc<dyn RuntimeNotifier>>,
}

impl PipelineDriver {
    /// Create a driver. Wire the job service and notifier before `run`.
    pub fn new(store: Arc<SqliteRuntimeStore>, config: RuntimeConfig) -> Self {
        let planner = RuntimePlanner::new(config.clone());
        let prefetch = PrefetchTrigger::new(config.prefetch.clone(), config.progress_conf_min);
        let misconceptions = MisconceptionResolver::new(config.misconception.clone());
        Self {
            store,
            config,
            planner,
            prefetch,
            misconceptions,
            jobs: None,
            notifier: None,
        }
    }

    /// Wire the background job service.
    pub fn with_job_service(mut self, jobs: Arc<dyn JobService>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Wire the push notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn RuntimeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Process a runtime-update job to the current end of the user's
    /// event stream (bounded by the per-invocation page budget).
    pub async fn run(&self, job: &RuntimeUpdateJob, cancel: &Cancellation) -> Result<RunReport> {
        let started = Instant::now();
        let user_id = job.user_id.ok_or(Error::MissingOwner)?;
        let job_service = self
            .jobs
            .clone()
            .ok_or_else(|| Error::MissingDeps("job_service".to_string()))?;
        let notifier = self
            .notifier
            .clone()
            .ok_or_else(|| Error::MissingDeps("notifier".to_string()))?;

        let mut cursor = self
            .store
            .get_cursor(user_id, RUNTIME_UPDATE_CONSUMER)
            .map_err(|e| e.at_stage(JobStage::Scan))?;

        let mut report = RunReport::default();
        let page_size = self.config.pipeline.page_size;
        for _ in 0..self.config.pipeline.max_pages {
            if cancel.is_canceled() {
                report.canceled = true;
                break;
            }
            let events = self
                .store
                .events_after_cursor(user_id, cursor, page_size)
                .map_err(|e| e.at_stage(JobStage::Scan))?;
            if events.is_empty() {
                break;
            }
            let page_len = events.len();

            let effects = self
                .store
                .with_transaction(|| self.apply_page(user_id, &events))?;
            let last = &events[page_len - 1];
            cursor = Some(last.cursor_key());
            report.pages += 1;
            report.processed += effects.processed;
            report.prompts_emitted += effects.prompts.len() as u32;

            // Post-commit side effects; losses are acceptable because the
            // pending prompt is persisted and jobs are debounced.
            for payload in effects.prompts {
                if let Err(error) = notifier.runtime_prompt(user_id, payload).await {
                    warn!(user_id = %user_id, %error, "prompt notification failed");
                }
            }
            for side_job in effects.side_jobs {
                let kind = side_job.kind;
                if let Err(error) = job_service.enqueue_debounced(side_job).await {
                    warn!(user_id = %user_id, %kind, %error, "side job enqueue failed");
                }
            }

            // A page that resolved nothing still came from a real trigger;
            // stamp the active path so ops can see the stall.
            if effects.processed == 0 && !job.trigger.is_empty() {
                self.session_fallback(user_id, &job.trigger)?;
            }

            if (page_len as u32) < page_size {
                break;
            }
        }

        // A triggered run that found no events at all gets the same stamp
        if report.pages == 0 && !report.canceled && !job.trigger.is_empty() {
            self.session_fallback(user_id, &job.trigger)?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            user_id = %user_id,
            processed = report.processed,
            pages = report.pages,
            prompts = report.prompts_emitted,
            canceled = report.canceled,
            "runtime update finished"
        );
        Ok(report)
    }

    /// Apply one page of events. Runs inside the page transaction.
    fn apply_page(&self, user_id: UserId, events: &[Event]) -> Result<PageEffects> {
        let mut effects = PageEffects {
            processed: 0,
            prompts: Vec::new(),
            side_jobs: Vec::new(),
        };
        let mut path_cache: HashMap<PathId, Path> = HashMap::new();

        for event in events {
            if self.store.transition_exists(user_id, event.id)? {
                continue;
            }
            if self.apply_event(user_id, event, &mut path_cache, &mut effects)? {
                effects.processed += 1;
            }
        }

        // The cursor covers skipped events too so the stream never stalls
        if let Some(last) = events.last() {
            self.store
                .upsert_cursor(user_id, RUNTIME_UPDATE_CONSUMER, last.created_at, last.id)?;
        }
        Ok(effects)
    }

    /// Apply one event. Returns whether a transition was recorded.
    fn apply_event(
        &self,
        user_id: UserId,
        event: &Event,
        path_cache: &mut HashMap<PathId, Path>,
        effects: &mut PageEffects,
    ) -> Result<bool> {
        let now = event.created_at;

        // Context resolution: explicit ids first, then activity -> node -> path
        let mut path_id = event.path_id;
        let mut node_id = event.node_id;
        let activity_id = event.activity_id;
        if let Some(activity) = activity_id {
            if node_id.is_none() || path_id.is_none() {
                if let Some(link) = self.store.get_node_activity(activity)? {
                    node_id.get_or_insert(link.node_id);
                    path_id.get_or_insert(link.path_id);
                }
            }
        }
        if path_id.is_none() {
            if let Some(node) = node_id {
                if let Some(path_node) = self.store.get_path_node(node)? {
                    path_id = Some(path_node.path_id);
                }
            }
        }
        let Some(path_id) = path_id else {
            // Cannot plan without a path; the cursor still advances
            warn!(event_id = %event.id, event_type = %event.event_type, "event has no resolvable path; skipped");
            return Ok(false);
        };

        let path = match path_cache.get(&path_id) {
            Some(path) => path.clone(),
            None => match self.store.get_path(path_id)? {
                Some(path) => {
                    path_cache.insert(path_id, path.clone());
                    path
                }
                None => {
                    warn!(event_id = %event.id, path_id = %path_id, "unknown path; event skipped");
                    return Ok(false);
                }
            },
        };

        let mut path_run = self
            .store
            .get_path_run(user_id, path_id)?
            .unwrap_or_else(|| PathRun::not_started(user_id, path_id, now));
        let (from_state, to_state) = path_run.apply_event(event, now);

        let mut node_run = match node_id {
            Some(node) => Some(
                self.store
                    .get_node_run(user_id, node)?
                    .unwrap_or_else(|| NodeRun::not_started(user_id, node, now)),
            ),
            None => None,
        };

        if let Some(run) = node_run.as_mut() {
            run.apply_event(event, now);

            // Prereq gate: entering a node refreshes the readiness cache
            if event.event_type == EventType::NodeOpened && self.config.readiness.enabled {
                if let Some(document) = self.store.get_node_document(run.node_id)? {
                    let evaluator = ReadinessEvaluator::new(
                        self.config.readiness.clone(),
                        self.config.coverage_debt.clone(),
                    );
                    match evaluator.evaluate(&self.store, user_id, path_id, &document, now) {
                        Ok(result) => run.runtime.readiness = Some(result.snapshot),
                        Err(error) => {
                            warn!(node_id = %run.node_id, %error, "prereq readiness evaluation failed")
                        }
                    }
                }
            }

            // Misconception resolution never blocks state-machine progress
            if event.event_type == EventType::QuestionAnswered {
                let concept_ids = self.concept_ids_for_answer(path_id, run, event);
                if let Err(error) = self.misconceptions.resolve_answer(
                    &self.store,
                    user_id,
                    Some(run.node_id),
                    event,
                    &concept_ids,
                    now,
                ) {
                    warn!(%error, "misconception resolution failed");
                }
            }

            let outcome = self
                .planner
                .handle_event(&self.store, &path, &mut path_run, run, event, now)?;
            if let Some(payload) = outcome.prompt {
                effects.prompts.push(payload);
            }
            effects.side_jobs.extend(outcome.side_jobs);
        }

        if let Some(activity) = activity_id {
            let mut activity_run = self
                .store
                .get_activity_run(user_id, activity)?
                .unwrap_or_else(|| crate::state::ActivityRun::not_started(user_id, activity, now));
            activity_run.apply_event(event, now);
            self.store.upsert_activity_run(&activity_run)?;
        }

        // Forward progress makes (path, node) a prefetch candidate
        if event.event_type.is_forward_progress() {
            if let (Some(node), Some(run)) = (node_id, node_run.as_ref()) {
                let completed = run.state == NodeRunState::Completed;
                match self
                    .prefetch
                    .evaluate(&self.store, &path, &mut path_run, node, completed, now)
                {
                    Ok(jobs) => effects.side_jobs.extend(jobs),
                    Err(error) => warn!(node_id = %node, %error, "prefetch evaluation failed"),
                }
            }
        }

        self.store.upsert_path_run(&path_run)?;
        if let Some(run) = node_run.as_ref() {
            self.store.upsert_node_run(run)?;
        }

        self.store.insert_transition(&PathRunTransition {
            user_id,
            event_id: event.id,
            path_id,
            event_type: event.event_type,
            from_state,
            to_state,
            occurred_at: event.occurred_at,
            payload: event.normalized_data(),
        })?;
        debug!(event_id = %event.id, event_type = %event.event_type, from = ?from_state, to = ?to_state, "event applied");
        Ok(true)
    }

    /// Concept ids an answered question maps to: ids on the event plus
    /// the answered block's annotations. Lookup failures resolve to the
    /// event-level ids only.
    fn concept_ids_for_answer(
        &self,
        path_id: PathId,
        node_run: &NodeRun,
        event: &Event,
    ) -> Vec<ConceptId> {
        let mut ids = event.concept_ids();
        let Some(block_id) = event.block_id() else {
            return ids;
        };
        let document = match self.store.get_node_document(node_run.node_id) {
            Ok(Some(document)) => document,
            _ => return ids,
        };
        let Some(block) = document.block(&block_id) else {
            return ids;
        };
        for id in &block.concept_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if !block.concept_keys.is_empty() {
            if let Ok(concepts) = self
                .store
                .concepts_by_scope_and_keys(path_id, &block.concept_keys)
            {
                for concept in concepts {
                    let id = concept.effective_id();
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids
    }

    /// Zero events on a non-empty trigger: stamp the active path so ops
    /// can tell a quiet stream from a stalled consumer.
    fn session_fallback(&self, user_id: UserId, trigger: &str) -> Result<()> {
        let Some(mut path_run) = self.store.latest_path_run(user_id)? else {
            return Ok(());
        };
        path_run.runtime.last_runtime_trigger = Some(trigger.to_string());
        path_run.runtime.last_runtime_trigger_at = Some(Utc::now());
        self.store.upsert_path_run(&path_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PathNode, RuntimePlan};
    use crate::concept::{
        Concept, ConceptState, MisconceptionInstance, MisconceptionResolutionState,
        MisconceptionStatus, ResolutionStatus,
    };
    use crate::config::{RlConfig, RlMode};
    use crate::document::{Block, BlockKind, NodeDocument};
    use crate::ids::{BlockId, NodeId};
    use crate::policy::{ModelParams, ModelSnapshot, PolicyEvalSnapshot};
    use crate::state::{PromptReason, PromptStatus, PromptType};
    use async_trait::async_trait;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingJobs(Mutex<Vec<DebouncedJob>>);

    #[async_trait]
    impl JobService for RecordingJobs {
        async fn enqueue_debounced(&self, job: DebouncedJob) -> Result<()> {
            self.0.lock().unwrap().push(job);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<PromptPayload>>);

    #[async_trait]
    impl RuntimeNotifier for RecordingNotifier {
        async fn runtime_prompt(&self, _user_id: UserId, payload: PromptPayload) -> Result<()> {
            self.0.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct Harness {
        store: Arc<SqliteRuntimeStore>,
        driver: PipelineDriver,
        jobs: Arc<RecordingJobs>,
        notifications: Arc<RecordingNotifier>,
        user: UserId,
        path: PathId,
        node: NodeId,
        concept: ConceptId,
    }

    /// Seed a ready path with one node whose document is
    /// `[p1 paragraph, q1 quick_check(c1)]` and a weak state on c1.
    fn harness_with_config(config: RuntimeConfig) -> Harness {
        let store = Arc::new(SqliteRuntimeStore::in_memory().unwrap());
        let user = UserId::new();
        let path_id = PathId::new();
        let node_id = NodeId::new();

        let path = Path::new(path_id).with_material_set("ms-1");
        store.upsert_path(&path).unwrap();
        store
            .upsert_path_node(&PathNode {
                id: node_id,
                path_id,
                position: 0,
                title: "intro".to_string(),
            })
            .unwrap();

        let document = NodeDocument::new(
            node_id,
            vec![
                Block::new("p1", BlockKind::Paragraph),
                Block::new("q1", BlockKind::QuickCheck).with_concept_keys(["c1"]),
            ],
        );
        store.upsert_node_document(&document).unwrap();

        let concept = Concept {
            id: ConceptId::new(),
            key: "c1".to_string(),
            scope_id: path_id,
            canonical_concept_id: None,
        };
        store.upsert_concept(&concept).unwrap();
        let mut state = ConceptState::new(user, concept.id, 0.3, 0.4);
        state.epistemic_uncertainty = 0.6;
        store.upsert_concept_state(&state).unwrap();

        let jobs = Arc::new(RecordingJobs::default());
        let notifications = Arc::new(RecordingNotifier::default());
        let driver = PipelineDriver::new(store.clone(), config)
            .with_job_service(jobs.clone())
            .with_notifier(notifications.clone());
        Harness {
            store,
            driver,
            jobs,
            notifications,
            user,
            path: path_id,
            node: node_id,
            concept: concept.id,
        }
    }

    fn harness() -> Harness {
        harness_with_config(RuntimeConfig::default())
    }

    fn seed_e1_events(h: &Harness, t0: DateTime<Utc>) {
        let events = [
            Event::new(h.user, EventType::NodeOpened, t0)
                .with_path(h.path)
                .with_node(h.node)
                .with_session("s1"),
            Event::new(h.user, EventType::BlockViewed, t0 + Duration::minutes(1))
                .with_node(h.node)
                .with_session("s1")
                .with_data("block_id", "p1"),
            Event::new(h.user, EventType::BlockRead, t0 + Duration::minutes(2))
                .with_node(h.node)
                .with_session("s1")
                .with_data("block_id", "p1"),
        ];
        for event in events {
            h.store.insert_event(&event).unwrap();
        }
    }

    async fn run(h: &Harness) -> RunReport {
        h.driver
            .run(
                &RuntimeUpdateJob::new(h.user).with_trigger("event"),
                &Cancellation::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_owner_fails_validation() {
        let h = harness();
        let job = RuntimeUpdateJob {
            user_id: None,
            trigger: "event".to_string(),
        };
        let err = h.driver.run(&job, &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, Error::MissingOwner));
    }

    #[tokio::test]
    async fn test_missing_deps_fails_validation() {
        let h = harness();
        let bare = PipelineDriver::new(h.store.clone(), RuntimeConfig::default());
        let err = bare
            .run(&RuntimeUpdateJob::new(h.user), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingDeps(_)));
    }

    /// E1: cadence quick-check after reading the first paragraph.
    #[tokio::test]
    async fn test_e1_reading_emits_quick_check() {
        let h = harness();
        let t0 = Utc::now() - Duration::minutes(2);
        seed_e1_events(&h, t0);

        let report = run(&h).await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.prompts_emitted, 1);
        assert_eq!(h.store.count_transitions(h.user).unwrap(), 3);

        let node_run = h.store.get_node_run(h.user, h.node).unwrap().unwrap();
        assert_eq!(node_run.runtime.read_blocks, vec![BlockId::from("p1")]);
        assert_eq!(node_run.runtime.blocks_seen, 1);
        assert!(node_run.runtime.was_shown(&BlockId::from("q1")));

        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        let prompt = path_run.runtime.runtime_prompt.as_ref().unwrap();
        assert_eq!(prompt.prompt_type, PromptType::QuickCheck);
        assert_eq!(prompt.block_id, Some(BlockId::from("q1")));
        assert_eq!(prompt.status, PromptStatus::Pending);
        assert!(matches!(
            prompt.reason,
            PromptReason::BanditInfoGain | PromptReason::ReadinessNotReady
        ));
        assert_eq!(path_run.runtime.prompts_in_window, 1);

        // The decision trace exists and references the prompt
        let trace = h
            .store
            .get_decision_trace(prompt.decision_trace_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(trace.chosen.prompt_id, prompt.id);
        assert_eq!(trace.chosen.block_id.as_deref(), Some("q1"));
        assert!(trace.chosen.reward.is_none());

        // The client was notified
        let pushed = h.notifications.0.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].prompt_id, prompt.id);
    }

    /// E2: a correct answer rewards the trace and clears the prompt.
    #[tokio::test]
    async fn test_e2_answer_rewards_trace() {
        let h = harness();
        let t0 = Utc::now() - Duration::minutes(3);
        seed_e1_events(&h, t0);
        run(&h).await;

        let answer = Event::new(
            h.user,
            EventType::QuestionAnswered,
            t0 + Duration::seconds(150),
        )
        .with_node(h.node)
        .with_session("s1")
        .with_data("block_id", "q1")
        .with_data("is_correct", true);
        h.store.insert_event(&answer).unwrap();
        let report = run(&h).await;
        assert_eq!(report.processed, 1);

        let node_run = h.store.get_node_run(h.user, h.node).unwrap().unwrap();
        assert!(node_run.runtime.was_completed(&BlockId::from("q1")));
        let stats = node_run.runtime.bandit.stats(&BlockId::from("q1"));
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.correct, 1);
        assert_eq!(stats.completed, 1);

        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        assert!(path_run.runtime.runtime_prompt.is_none());
        assert_eq!(
            path_run.runtime.last_prompt_status,
            Some(PromptStatus::Completed)
        );

        // Trace outcome advanced exactly once
        let traces: Vec<_> = h.jobs.0.lock().unwrap().clone();
        let train = traces
            .iter()
            .find(|j| j.kind == crate::services::JobKind::PolicyTrain)
            .expect("policy train enqueued");
        let trace = h
            .store
            .get_decision_trace(train.trace_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(trace.chosen.reward, Some(1.0));
        assert_eq!(trace.chosen.is_correct, Some(true));
        assert_eq!(
            trace.chosen.outcome_event.as_deref(),
            Some("question_answered")
        );
    }

    /// E3: the hourly cap blocks new prompts but never the cursor.
    #[tokio::test]
    async fn test_e3_rate_cap_blocks_prompt() {
        let h = harness();
        let now = Utc::now();

        // Two prompts already emitted 30 minutes into the window
        let mut path_run = PathRun::not_started(h.user, h.path, now);
        path_run.runtime.session_started_at = Some(now - Duration::minutes(10));
        path_run.runtime.prompt_window_started_at = Some(now - Duration::minutes(30));
        path_run.runtime.prompts_in_window = 2;
        path_run.runtime.last_prompt_at = Some(now - Duration::minutes(10));
        h.store.upsert_path_run(&path_run).unwrap();

        let mut plan = RuntimePlan::default();
        plan.max_prompts_per_hour = 2;
        let path = Path::new(h.path)
            .with_material_set("ms-1")
            .with_runtime_plan(plan);
        h.store.upsert_path(&path).unwrap();

        let event = Event::new(h.user, EventType::BlockRead, now)
            .with_node(h.node)
            .with_session("s1")
            .with_data("block_id", "p1");
        h.store.insert_event(&event).unwrap();

        let report = run(&h).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.prompts_emitted, 0);

        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        assert!(path_run.runtime.runtime_prompt.is_none());
        assert_eq!(path_run.runtime.prompts_in_window, 2);
        // The cursor advanced past the event
        let cursor = h
            .store
            .get_cursor(h.user, RUNTIME_UPDATE_CONSUMER)
            .unwrap()
            .unwrap();
        assert_eq!(cursor.1, event.id);
    }

    /// E4: fatigue forces a break and suppresses other prompts.
    #[tokio::test]
    async fn test_e4_fatigue_forces_break() {
        let h = harness();
        let now = Utc::now();

        let mut path_run = PathRun::not_started(h.user, h.path, now);
        path_run.runtime.session_started_at = Some(now - Duration::minutes(40));
        path_run.runtime.prompt_window_started_at = Some(now - Duration::minutes(40));
        path_run.runtime.prompts_in_window = 6;
        h.store.upsert_path_run(&path_run).unwrap();

        let mut node_run = NodeRun::not_started(h.user, h.node, now);
        node_run.runtime.fail_streak = 2;
        h.store.upsert_node_run(&node_run).unwrap();

        let event = Event::new(h.user, EventType::BlockRead, now)
            .with_node(h.node)
            .with_session("s1")
            .with_data("block_id", "p1");
        h.store.insert_event(&event).unwrap();

        let report = run(&h).await;
        assert_eq!(report.prompts_emitted, 1);

        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        let prompt = path_run.runtime.runtime_prompt.as_ref().unwrap();
        assert_eq!(prompt.prompt_type, PromptType::Break);
        assert_eq!(prompt.reason, PromptReason::Fatigue);
        assert!(path_run.runtime.fatigue_score >= 0.75);
        assert!(path_run.runtime.last_break_at.is_some());

        let pushed = h.notifications.0.lock().unwrap();
        assert_eq!(pushed[0].prompt_type, PromptType::Break);
        assert!(pushed[0].break_min.is_some());
    }

    /// E5: an incorrect answer on a resolved misconception relapses it.
    #[tokio::test]
    async fn test_e5_misconception_relapse() {
        let h = harness();
        let now = Utc::now();

        let mut instance = MisconceptionInstance::new(h.user, h.concept, 0.8);
        instance.status = MisconceptionStatus::Resolved;
        instance.support.resolution_confidence = 1.0;
        instance.support.resolution_evidence_count = 2;
        h.store.upsert_misconception(&instance).unwrap();

        let mut track = MisconceptionResolutionState::new(h.user, h.concept, 2);
        track.status = ResolutionStatus::Resolved;
        track.correct_count = 2;
        track.resolved_at = Some(now - Duration::days(1));
        h.store.upsert_resolution_state(&track).unwrap();

        let event = Event::new(h.user, EventType::QuestionAnswered, now)
            .with_node(h.node)
            .with_session("s1")
            .with_data("block_id", "q1")
            .with_data("question_id", "question-1")
            .with_data("is_correct", false);
        h.store.insert_event(&event).unwrap();
        run(&h).await;

        let tracks = h
            .store
            .resolution_states(h.user, &[h.concept])
            .unwrap();
        assert_eq!(tracks[0].status, ResolutionStatus::Relapsed);
        assert!(tracks[0].relapsed_at.is_some());

        let instances = h
            .store
            .tracked_misconceptions(h.user, &[h.concept])
            .unwrap();
        assert_eq!(instances[0].status, MisconceptionStatus::Relapsed);
        assert!(instances[0].support.resolution_confidence <= 0.35);
        let ctx = instances[0]
            .support
            .last_failed_context_after_resolution
            .as_ref()
            .unwrap();
        assert_eq!(ctx.block_id.as_deref(), Some("q1"));
        assert_eq!(ctx.node_id, Some(h.node));
    }

    /// E6: active mode picks the policy-preferred block.
    #[tokio::test]
    async fn test_e6_active_mode_overrides_baseline() {
        let config = RuntimeConfig {
            rl: RlConfig {
                mode: RlMode::Active,
                rollout_pct: 1.0,
                safe_min_samples: 10,
                safe_min_ips: 0.5,
                safe_min_lift: 0.0,
                ..RlConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let h = harness_with_config(config);

        // Second quick-check on a second concept, slightly stronger so
        // baseline prefers q1; citations tie both to p1
        let c2 = Concept {
            id: ConceptId::new(),
            key: "c2".to_string(),
            scope_id: h.path,
            canonical_concept_id: None,
        };
        h.store.upsert_concept(&c2).unwrap();
        let mut state = ConceptState::new(h.user, c2.id, 0.5, 0.6);
        state.epistemic_uncertainty = 0.3;
        h.store.upsert_concept_state(&state).unwrap();
        let document = NodeDocument::new(
            h.node,
            vec![
                Block::new("p1", BlockKind::Paragraph).with_citation("chunk-a"),
                Block::new("q1", BlockKind::QuickCheck)
                    .with_concept_keys(["c1"])
                    .with_citation("chunk-a"),
                Block::new("q2", BlockKind::QuickCheck)
                    .with_concept_keys(["c2"])
                    .with_citation("chunk-a"),
            ],
        );
        h.store.upsert_node_document(&document).unwrap();

        // A policy that dislikes info gain inverts the baseline ordering
        h.store
            .upsert_model_snapshot(&ModelSnapshot {
                key: "runtime_prompt".to_string(),
                version: 3,
                active: true,
                params: ModelParams {
                    bias: 1.0,
                    weights: HashMap::from([("info_gain".to_string(), -2.0)]),
                },
            })
            .unwrap();
        h.store
            .insert_policy_eval(&PolicyEvalSnapshot {
                key: "runtime_prompt".to_string(),
                samples: 10_000,
                ips: 1.1,
                lift: 0.05,
            })
            .unwrap();

        let t0 = Utc::now() - Duration::minutes(2);
        seed_e1_events(&h, t0);
        let report = run(&h).await;
        assert_eq!(report.prompts_emitted, 1);

        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        let prompt = path_run.runtime.runtime_prompt.as_ref().unwrap();
        assert_eq!(prompt.policy_mode, RlMode::Active);
        assert_eq!(prompt.block_id, Some(BlockId::from("q2")));
        assert_eq!(prompt.policy_version, Some(3));

        let trace = h
            .store
            .get_decision_trace(prompt.decision_trace_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(trace.chosen.policy_mode, RlMode::Active);
        assert_eq!(trace.chosen.block_id.as_deref(), Some("q2"));
        // Both distributions recorded for counterfactual IPS
        let q2 = trace
            .candidates
            .iter()
            .find(|c| c.block_id == "q2")
            .unwrap();
        assert!((trace.chosen.behavior_prob - q2.policy_prob).abs() < 1e-9);
        assert!((trace.chosen.shadow_prob - q2.baseline_prob).abs() < 1e-9);
        // Baseline would have picked q1
        let q1 = trace
            .candidates
            .iter()
            .find(|c| c.block_id == "q1")
            .unwrap();
        assert!(q1.score > q2.score);
        assert!(q2.policy_score > q1.policy_score);
    }

    /// Replays are idempotent: transitions are keyed by event id.
    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let h = harness();
        let t0 = Utc::now() - Duration::minutes(2);
        seed_e1_events(&h, t0);
        run(&h).await;
        assert_eq!(h.store.count_transitions(h.user).unwrap(), 3);

        // Rewind the cursor to force a replay of the same events
        let first = h.store.events_after_cursor(h.user, None, 1).unwrap();
        let before = first[0].cursor_key();
        h.store
            .upsert_cursor(h.user, RUNTIME_UPDATE_CONSUMER, before.0, before.1)
            .unwrap();

        let report = run(&h).await;
        // Already-transitioned events are skipped, cursor catches up
        assert_eq!(report.processed, 0);
        assert_eq!(h.store.count_transitions(h.user).unwrap(), 3);
        let node_run = h.store.get_node_run(h.user, h.node).unwrap().unwrap();
        assert_eq!(node_run.runtime.blocks_seen, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_event_advances_cursor() {
        let h = harness();
        let now = Utc::now();
        // No path, node, or activity context at all
        let event = Event::new(h.user, EventType::BlockRead, now).with_session("s1");
        h.store.insert_event(&event).unwrap();

        let report = run(&h).await;
        assert_eq!(report.processed, 0);
        assert_eq!(h.store.count_transitions(h.user).unwrap(), 0);
        let cursor = h
            .store
            .get_cursor(h.user, RUNTIME_UPDATE_CONSUMER)
            .unwrap()
            .unwrap();
        assert_eq!(cursor.1, event.id);
    }

    #[tokio::test]
    async fn test_session_fallback_stamps_trigger() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_path_run(&PathRun::not_started(h.user, h.path, now))
            .unwrap();

        let report = h
            .driver
            .run(
                &RuntimeUpdateJob::new(h.user).with_trigger("ws_reconnect"),
                &Cancellation::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        assert_eq!(
            path_run.runtime.last_runtime_trigger.as_deref(),
            Some("ws_reconnect")
        );
        assert!(path_run.runtime.last_runtime_trigger_at.is_some());
    }

    #[tokio::test]
    async fn test_session_fallback_fires_per_page() {
        let config = RuntimeConfig {
            pipeline: crate::config::PipelineConfig {
                page_size: 2,
                max_pages: 10,
            },
            ..RuntimeConfig::default()
        };
        let h = harness_with_config(config);
        let t0 = Utc::now() - Duration::minutes(5);
        h.store
            .upsert_path_run(&PathRun::not_started(h.user, h.path, t0))
            .unwrap();

        // First page: two events with no resolvable path at all
        for i in 0..2 {
            h.store
                .insert_event(
                    &Event::new(h.user, EventType::BlockRead, t0 + Duration::seconds(i))
                        .with_session("s1"),
                )
                .unwrap();
        }
        // Later pages process normally
        seed_e1_events(&h, t0 + Duration::minutes(1));

        let report = run(&h).await;
        assert_eq!(report.processed, 3);

        // The stalled first page stamped the trigger even though the
        // run as a whole made progress
        let path_run = h.store.get_path_run(h.user, h.path).unwrap().unwrap();
        assert_eq!(
            path_run.runtime.last_runtime_trigger.as_deref(),
            Some("event")
        );
        assert!(path_run.runtime.last_runtime_trigger_at.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_before_first_page() {
        let h = harness();
        seed_e1_events(&h, Utc::now());
        let cancel = Cancellation::new();
        cancel.cancel();
        let report = run_with_cancel(&h, &cancel).await;
        assert!(report.canceled);
        assert_eq!(report.processed, 0);
        // Nothing was consumed; a retry resumes from the same cursor
        assert!(h
            .store
            .get_cursor(h.user, RUNTIME_UPDATE_CONSUMER)
            .unwrap()
            .is_none());
    }

    async fn run_with_cancel(h: &Harness, cancel: &Cancellation) -> RunReport {
        h.driver
            .run(&RuntimeUpdateJob::new(h.user).with_trigger("event"), cancel)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_paging_splits_transactions() {
        let config = RuntimeConfig {
            pipeline: crate::config::PipelineConfig {
                page_size: 2,
                max_pages: 10,
            },
            ..RuntimeConfig::default()
        };
        let h = harness_with_config(config);
        let t0 = Utc::now() - Duration::minutes(2);
        seed_e1_events(&h, t0);
        let report = run(&h).await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.pages, 2);
    }
}
