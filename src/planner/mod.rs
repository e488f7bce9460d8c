//! The runtime planner: decides whether to surface a prompt and which.
//!
//! Order of operations per planner-relevant event: resolve any pending
//! prompt against the event, apply rate and cadence gates, check break
//! conditions (fatigue outranks elapsed time), refresh readiness,
//! enumerate and score candidates, blend in the learned policy, select,
//! and emit with full bookkeeping. Everything here runs inside the
//! event's page transaction except the push notification, which the
//! pipeline fires after commit.

pub mod cadence;
pub mod candidates;
pub mod fatigue;
mod proptest;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::catalog::{Path, ResolvedPlan};
use crate::config::{RlMode, RuntimeConfig};
use crate::error::Result;
use crate::event::{Event, EventType};
use crate::ids::{PromptId, TraceId};
use crate::policy;
use crate::readiness::{ReadinessEvaluator, ReadinessResult, ReadinessStatus};
use crate::services::{DebouncedJob, JobKind, PromptPayload};
use crate::state::{
    NodeRun, PathRun, PromptReason, PromptStatus, PromptType, RuntimePrompt,
};
use crate::storage::SqliteRuntimeStore;
use crate::trace::{
    CandidateTrace, ChosenTrace, ChosenUpdate, DecisionTrace, TraceInputs,
};

pub use candidates::{Candidate, ScoringConfig};

/// What the planner decided for one event.
#[derive(Debug, Default)]
pub struct PlannerOutcome {
    /// Payload to push after the page commits
    pub prompt: Option<PromptPayload>,
    /// Best-effort side jobs to enqueue after the page commits
    pub side_jobs: Vec<DebouncedJob>,
}

/// How a pending prompt resolved against an event.
struct PendingResolution {
    status: PromptStatus,
    reward: f64,
    is_correct: Option<bool>,
    record_attempt: bool,
    dismissed: bool,
}

/// The runtime planner.
#[derive(Debug, Clone)]
pub struct RuntimePlanner {
    config: RuntimeConfig,
}

impl RuntimePlanner {
    /// Create a planner with the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// The planner's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Consider one event for the learner's active node.
    pub fn handle_event(
        &self,
        store: &SqliteRuntimeStore,
        path: &Path,
        path_run: &mut PathRun,
        node_run: &mut NodeRun,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<PlannerOutcome> {
        let mut outcome = PlannerOutcome::default();
        if !event.event_type.is_planner_relevant() {
            return Ok(outcome);
        }
        path_run.runtime.note_signal(event, now);
        let plan = path.runtime_plan.for_node(&node_run.node_id);

        // Resolve an outstanding prompt before anything else; while one
        // is pending no new prompt may be emitted.
        if let Some(pending) = path_run.runtime.runtime_prompt.clone() {
            match self.resolve_pending(&pending, event) {
                Some(resolution) => {
                    self.apply_resolution(
                        store,
                        path_run,
                        node_run,
                        &pending,
                        &resolution,
                        event,
                        now,
                        &mut outcome,
                    );
                }
                None => return Ok(outcome),
            }
        }

        // Rate gates for quick-check/flashcard emission
        let window_ok = path_run
            .runtime
            .window_has_room(plan.max_prompts_per_hour, now);
        let gap_ok = match path_run.runtime.last_prompt_at {
            None => true,
            Some(last) => {
                (now - last).num_seconds() as f64 / 60.0 >= plan.min_prompt_gap_minutes
            }
        };

        let progress_not_ok = path_run
            .runtime
            .latest_signal()
            .and_then(|s| s.progress_state.as_deref())
            .map(|p| p != "progressing")
            .unwrap_or(false);

        let elapsed_minutes = path_run
            .runtime
            .session_started_at
            .map(|start| (now - start).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        let fatigue = fatigue::fatigue_score(
            &self.config.fatigue,
            elapsed_minutes,
            path_run.runtime.prompts_in_window,
            node_run.runtime.fail_streak,
        );
        path_run.runtime.fatigue_score = fatigue;

        let mut quick_check_ok =
            cadence::quick_check_eligible(&plan.quick_check, &node_run.runtime, now);
        let mut flashcard_ok =
            cadence::flashcard_eligible(&plan.flashcard, &node_run.runtime, now);
        if progress_not_ok {
            quick_check_ok = false;
            flashcard_ok = false;
        }
        if self.config.fatigue.enabled && fatigue >= self.config.fatigue.suppress_threshold {
            quick_check_ok = false;
            flashcard_ok = false;
        }

        // Break precedence: a due break outranks every candidate.
        let break_reason = if self.config.fatigue.enabled
            && fatigue >= self.config.fatigue.break_threshold
            && cadence::break_gap_ok(
                self.config.fatigue.min_break_gap_minutes,
                &path_run.runtime,
                now,
            ) {
            Some(PromptReason::Fatigue)
        } else if !progress_not_ok
            && cadence::break_due(&plan.break_policy, &path_run.runtime, now)
        {
            Some(PromptReason::TimeElapsed)
        } else {
            None
        };
        if let Some(reason) = break_reason {
            self.emit_break(store, path_run, node_run, &plan, reason, fatigue, now, &mut outcome)?;
            return Ok(outcome);
        }

        if !window_ok || !gap_ok {
            return Ok(outcome);
        }

        // Readiness refresh: always refreshed when planning a non-break
        // prompt; the cached snapshot serves consumers between plans.
        let document = store.get_node_document(node_run.node_id)?;
        let readiness = match (&document, self.config.readiness.enabled) {
            (Some(doc), true) => {
                let evaluator = ReadinessEvaluator::new(
                    self.config.readiness.clone(),
                    self.config.coverage_debt.clone(),
                );
                let result =
                    evaluator.evaluate(store, path_run.user_id, path.id, doc, now)?;
                node_run.runtime.readiness = Some(result.snapshot.clone());
                Some(result)
            }
            _ => None,
        };

        // A not-ready learner is forced to remediate: per-lesson caps
        // still bind, block/time gaps do not.
        if let Some(result) = &readiness {
            if result.snapshot.status == ReadinessStatus::NotReady && !progress_not_ok {
                quick_check_ok = quick_check_ok
                    || cadence::under_lesson_cap(
                        node_run.runtime.quick_checks_shown,
                        plan.quick_check.max_per_lesson,
                    );
                flashcard_ok = flashcard_ok
                    || cadence::under_lesson_cap(
                        node_run.runtime.flashcards_shown,
                        plan.flashcard.max_per_lesson,
                    );
            }
        }
        if !quick_check_ok && !flashcard_ok {
            return Ok(outcome);
        }
        let Some(document) = document else {
            return Ok(outcome);
        };

        let candidates = candidates::enumerate_candidates(
            &document,
            &node_run.runtime,
            readiness.as_ref(),
            ScoringConfig {
                bandit: &self.config.bandit,
                counterfactual: &self.config.counterfactual,
                testlet: &self.config.testlet,
                readiness: &self.config.readiness,
            },
            quick_check_ok,
            flashcard_ok,
            now,
        );
        if candidates.is_empty() {
            return Ok(outcome);
        }

        self.select_and_emit(
            store,
            path_run,
            node_run,
            candidates,
            readiness.as_ref(),
            fatigue,
            now,
            &mut outcome,
        )?;
        Ok(outcome)
    }

    /// Match an event against the pending prompt.
    fn resolve_pending(&self, pending: &RuntimePrompt, event: &Event) -> Option<PendingResolution> {
        match event.event_type {
            EventType::RuntimePromptCompleted => {
                let matches = event
                    .prompt_id()
                    .map(|p| p.matches(&pending.id))
                    .unwrap_or(false);
                matches.then_some(PendingResolution {
                    status: PromptStatus::Completed,
                    reward: 1.0,
                    is_correct: None,
                    record_attempt: false,
                    dismissed: false,
                })
            }
            EventType::RuntimePromptDismissed => {
                let matches = event
                    .prompt_id()
                    .map(|p| p.matches(&pending.id))
                    .unwrap_or(false);
                matches.then_some(PendingResolution {
                    status: PromptStatus::Dismissed,
                    reward: 0.0,
                    is_correct: None,
                    record_attempt: false,
                    dismissed: true,
                })
            }
            EventType::QuestionAnswered => {
                let matches = match (&pending.block_id, event.block_id()) {
                    (Some(block), Some(answered)) => *block == answered,
                    _ => false,
                };
                matches.then(|| {
                    let is_correct = event.is_correct().unwrap_or(false);
                    PendingResolution {
                        status: if is_correct {
                            PromptStatus::Completed
                        } else {
                            PromptStatus::Answered
                        },
                        reward: if is_correct { 1.0 } else { 0.0 },
                        is_correct: Some(is_correct),
                        record_attempt: true,
                        dismissed: false,
                    }
                })
            }
            _ => None,
        }
    }

    /// Apply a resolution: bandit counters, trace outcome, prompt clear,
    /// and the policy-refresh side jobs.
    #[allow(clippy::too_many_arguments)]
    fn apply_resolution(
        &self,
        store: &SqliteRuntimeStore,
        path_run: &mut PathRun,
        node_run: &mut NodeRun,
        pending: &RuntimePrompt,
        resolution: &PendingResolution,
        event: &Event,
        now: DateTime<Utc>,
        outcome: &mut PlannerOutcome,
    ) {
        if let Some(block_id) = &pending.block_id {
            let stats = node_run.runtime.bandit.stats_mut(block_id);
            if resolution.record_attempt {
                stats.attempts = stats.attempts.saturating_add(1);
                if resolution.is_correct == Some(true) {
                    stats.correct = stats.correct.saturating_add(1);
                }
                stats.last_score = Some(resolution.reward);
            }
            if resolution.dismissed {
                stats.dismissed = stats.dismissed.saturating_add(1);
            }
            if resolution.status == PromptStatus::Completed {
                node_run.runtime.mark_block_completed(block_id);
            }
            let keep_uncompleted = self.config.reshow_uncompleted_prompts
                && resolution.status != PromptStatus::Completed;
            if keep_uncompleted {
                node_run.runtime.unshow_block(block_id);
            }
        }

        path_run.runtime.clear_prompt(resolution.status);

        if let Some(trace_id) = pending.decision_trace_id {
            let update = ChosenUpdate {
                reward: resolution.reward,
                outcome_event: event.event_type.as_str().to_string(),
                is_correct: resolution.is_correct,
                outcome_at: now,
            };
            // A failed outcome write never blocks event processing
            if let Err(error) = store.update_chosen(trace_id, &update) {
                warn!(trace_id = %trace_id, %error, "decision trace outcome update failed");
            }
            let key = &self.config.rl.policy_key;
            outcome.side_jobs.push(
                DebouncedJob::new(JobKind::PolicyEvalRefresh, path_run.user_id)
                    .with_policy_key(key.clone()),
            );
            outcome.side_jobs.push(
                DebouncedJob::new(JobKind::PolicyTrain, path_run.user_id)
                    .with_policy_key(key.clone())
                    .with_trace(trace_id),
            );
        }
    }

    /// Emit a break prompt.
    #[allow(clippy::too_many_arguments)]
    fn emit_break(
        &self,
        store: &SqliteRuntimeStore,
        path_run: &mut PathRun,
        node_run: &NodeRun,
        plan: &ResolvedPlan,
        reason: PromptReason,
        fatigue: f64,
        now: DateTime<Utc>,
        outcome: &mut PlannerOutcome,
    ) -> Result<()> {
        let prompt_id = PromptId::new();
        let trace_id = TraceId::new();
        let prompt = RuntimePrompt {
            id: prompt_id,
            prompt_type: PromptType::Break,
            node_id: node_run.node_id,
            block_id: None,
            reason,
            status: PromptStatus::Pending,
            created_at: now,
            policy_key: None,
            policy_mode: RlMode::Off,
            policy_version: None,
            behavior_prob: Some(1.0),
            shadow_prob: Some(1.0),
            decision_trace_id: Some(trace_id),
        };

        let trace = DecisionTrace {
            id: trace_id,
            user_id: path_run.user_id,
            occurred_at: now,
            decision_type: DecisionTrace::RUNTIME_PROMPT.to_string(),
            path_id: path_run.path_id,
            inputs: self.trace_inputs(path_run, node_run, fatigue, RlMode::Off, None),
            candidates: Vec::new(),
            chosen: ChosenTrace {
                prompt_id,
                block_id: None,
                prompt_type: PromptType::Break,
                reason,
                score: fatigue,
                policy_score: fatigue,
                behavior_prob: 1.0,
                shadow_prob: 1.0,
                policy_mode: RlMode::Off,
                reward: None,
                outcome_event: None,
                is_correct: None,
                outcome_at: None,
            },
        };
        store.insert_decision_trace(&trace)?;

        outcome.prompt = Some(PromptPayload {
            path_id: path_run.path_id,
            node_id: node_run.node_id,
            block_id: None,
            prompt_type: PromptType::Break,
            reason,
            prompt_id,
            created_at: now,
            break_min: Some(plan.break_policy.break_min),
            break_max: Some(plan.break_policy.break_max),
        });
        path_run.runtime.note_prompt_emitted(prompt, now);
        debug!(user_id = %path_run.user_id, %reason, "break prompt emitted");
        Ok(())
    }

    /// Score with the policy, pick per mode, and emit the prompt.
    #[allow(clippy::too_many_arguments)]
    fn select_and_emit(
        &self,
        store: &SqliteRuntimeStore,
        path_run: &mut PathRun,
        node_run: &mut NodeRun,
        candidates: Vec<Candidate>,
        readiness: Option<&ReadinessResult>,
        fatigue: f64,
        now: DateTime<Utc>,
        outcome: &mut PlannerOutcome,
    ) -> Result<PromptId> {
        // Policy snapshot load failures degrade to baseline
        let snapshot = if self.config.rl.mode == RlMode::Off {
            None
        } else {
            match policy::load_active_snapshot(store, &self.config.rl.policy_key) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(%error, "policy snapshot load failed; baseline mode");
                    None
                }
            }
        };
        let eval = match store.latest_policy_eval(&self.config.rl.policy_key) {
            Ok(eval) => eval,
            Err(error) => {
                warn!(%error, "policy eval load failed; treating gates as failed");
                None
            }
        };
        let mode = policy::effective_mode(
            &self.config.rl,
            snapshot.as_ref(),
            eval.as_ref(),
            path_run.user_id,
        );

        let progress_confidence = path_run
            .runtime
            .latest_signal()
            .and_then(|s| s.progress_confidence)
            .unwrap_or(0.0);
        let readiness_score = readiness.map(|r| r.snapshot.score).unwrap_or(0.0);

        let baseline_scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let policy_scores: Vec<f64> = match &snapshot {
            Some(model) => candidates
                .iter()
                .map(|c| {
                    model.score(&self.feature_vector(
                        c,
                        fatigue,
                        progress_confidence,
                        readiness_score,
                        node_run.runtime.fail_streak,
                    ))
                })
                .collect(),
            None => baseline_scores.clone(),
        };
        let baseline_prob = policy::softmax(&baseline_scores, 1.0);
        let policy_prob = policy::softmax(&policy_scores, self.config.rl.softmax_temp);

        let chosen_index = match mode {
            RlMode::Active => policy::argmax(&policy_scores),
            _ => policy::argmax(&baseline_scores),
        }
        .unwrap_or(0);
        let chosen = &candidates[chosen_index];
        let (behavior_prob, shadow_prob) = match mode {
            RlMode::Active => (policy_prob[chosen_index], baseline_prob[chosen_index]),
            _ => (baseline_prob[chosen_index], policy_prob[chosen_index]),
        };

        let prompt_id = PromptId::new();
        let trace_id = TraceId::new();
        let policy_version = snapshot.as_ref().map(|s| s.version);

        node_run
            .runtime
            .mark_shown(&chosen.block_id, chosen.prompt_type, chosen.info_gain, now);

        let candidate_traces: Vec<CandidateTrace> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| CandidateTrace {
                block_id: c.block_id.as_str().to_string(),
                prompt_type: c.prompt_type,
                concept_ids: c.concept_ids.clone(),
                info_gain: c.info_gain,
                explore: c.explore,
                testlet_uncertainty: c.testlet_uncertainty,
                readiness_boost: c.readiness_boost,
                counterfactual_boost: c.counterfactual_boost,
                recency_penalty: c.recency_penalty,
                counterfactual: c.counterfactual,
                reason: c.reason,
                score: c.score,
                policy_score: policy_scores[i],
                baseline_prob: baseline_prob[i],
                policy_prob: policy_prob[i],
            })
            .collect();

        let trace = DecisionTrace {
            id: trace_id,
            user_id: path_run.user_id,
            occurred_at: now,
            decision_type: DecisionTrace::RUNTIME_PROMPT.to_string(),
            path_id: path_run.path_id,
            inputs: self.trace_inputs(path_run, node_run, fatigue, mode, policy_version),
            candidates: candidate_traces,
            chosen: ChosenTrace {
                prompt_id,
                block_id: Some(chosen.block_id.as_str().to_string()),
                prompt_type: chosen.prompt_type,
                reason: chosen.reason,
                score: chosen.score,
                policy_score: policy_scores[chosen_index],
                behavior_prob,
                shadow_prob,
                policy_mode: mode,
                reward: None,
                outcome_event: None,
                is_correct: None,
                outcome_at: None,
            },
        };
        store.insert_decision_trace(&trace)?;

        let prompt = RuntimePrompt {
            id: prompt_id,
            prompt_type: chosen.prompt_type,
            node_id: node_run.node_id,
            block_id: Some(chosen.block_id.clone()),
            reason: chosen.reason,
            status: PromptStatus::Pending,
            created_at: now,
            policy_key: Some(self.config.rl.policy_key.clone()),
            policy_mode: mode,
            policy_version,
            behavior_prob: Some(behavior_prob),
            shadow_prob: Some(shadow_prob),
            decision_trace_id: Some(trace_id),
        };
        outcome.prompt = Some(PromptPayload {
            path_id: path_run.path_id,
            node_id: node_run.node_id,
            block_id: Some(chosen.block_id.as_str().to_string()),
            prompt_type: chosen.prompt_type,
            reason: chosen.reason,
            prompt_id,
            created_at: now,
            break_min: None,
            break_max: None,
        });
        path_run.runtime.note_prompt_emitted(prompt, now);
        debug!(
            user_id = %path_run.user_id,
            block_id = %chosen.block_id,
            reason = %chosen.reason,
            mode = %mode,
            "runtime prompt emitted"
        );
        Ok(prompt_id)
    }

    fn trace_inputs(
        &self,
        path_run: &PathRun,
        node_run: &NodeRun,
        fatigue: f64,
        mode: RlMode,
        policy_version: Option<i64>,
    ) -> TraceInputs {
        let signal = path_run.runtime.latest_signal();
        TraceInputs {
            readiness: node_run.runtime.readiness.clone(),
            fatigue_score: fatigue,
            progress_state: signal.and_then(|s| s.progress_state.clone()),
            progress_confidence: signal.and_then(|s| s.progress_confidence),
            policy_mode: mode,
            policy_key: self.config.rl.policy_key.clone(),
            policy_version,
        }
    }

    /// The candidate's feature vector for the linear policy.
    fn feature_vector(
        &self,
        candidate: &Candidate,
        fatigue: f64,
        progress_confidence: f64,
        readiness_score: f64,
        fail_streak: u32,
    ) -> HashMap<String, f64> {
        HashMap::from([
            ("info_gain".to_string(), candidate.info_gain),
            ("explore".to_string(), candidate.explore),
            (
                "testlet_uncertainty".to_string(),
                candidate.testlet_uncertainty,
            ),
            ("readiness_boost".to_string(), candidate.readiness_boost),
            (
                "counterfactual_boost".to_string(),
                candidate.counterfactual_boost,
            ),
            ("recency_penalty".to_string(), candidate.recency_penalty),
            ("fatigue_score".to_string(), fatigue),
            ("progress_confidence".to_string(), progress_confidence),
            ("readiness_score".to_string(), readiness_score),
            ("fail_streak".to_string(), f64::from(fail_streak)),
            (
                "counterfactual".to_string(),
                if candidate.counterfactual { 1.0 } else { 0.0 },
            ),
            (
                "kind_quick_check".to_string(),
                if candidate.prompt_type == PromptType::QuickCheck {
                    1.0
                } else {
                    0.0
                },
            ),
            (
                "kind_flashcard".to_string(),
                if candidate.prompt_type == PromptType::Flashcard {
                    1.0
                } else {
                    0.0
                },
            ),
        ])
    }
}
