//! Misconception resolution over answered questions.
//!
//! Every answered question touching a concept with an active
//! misconception feeds a per-concept resolution track. Correct answers
//! accumulate credit toward `required_correct`; an incorrect answer on a
//! resolved track relapses it. The underlying misconception instance
//! mirrors the track so downstream consumers see resolution evidence
//! without joining both tables.

use chrono::{DateTime, Duration, Utc};

use crate::concept::{
    FailedContext, MisconceptionInstance, MisconceptionResolutionState, MisconceptionStatus,
    ResolutionStatus,
};
use crate::config::MisconceptionConfig;
use crate::error::Result;
use crate::event::Event;
use crate::ids::{ConceptId, NodeId, UserId};
use crate::storage::SqliteRuntimeStore;

/// Confidence ceiling applied to a relapsed misconception.
const RELAPSE_CONFIDENCE_CAP: f64 = 0.35;

/// Applies answered questions to misconception resolution tracks.
#[derive(Debug, Clone)]
pub struct MisconceptionResolver {
    config: MisconceptionConfig,
}

impl MisconceptionResolver {
    /// Create a resolver with the given tunables.
    pub fn new(config: MisconceptionConfig) -> Self {
        Self { config }
    }

    /// Fold one answered question into the track and its instance.
    pub fn apply_answer(
        &self,
        track: &mut MisconceptionResolutionState,
        instance: &mut MisconceptionInstance,
        event: &Event,
        node_id: Option<NodeId>,
        now: DateTime<Utc>,
    ) {
        let is_correct = event.is_correct().unwrap_or(false);
        if is_correct {
            let mut credit = 1u32;
            if event.transfer_success() {
                credit += 1;
            }
            track.correct_count = track.correct_count.saturating_add(credit);
            track.last_correct_at = Some(now);
            if track.status == ResolutionStatus::Open
                || track.status == ResolutionStatus::Relapsed
            {
                track.status = ResolutionStatus::Resolving;
            }
            if track.correct_count >= track.required_correct
                && track.status != ResolutionStatus::Resolved
            {
                track.status = ResolutionStatus::Resolved;
                track.resolved_at = Some(now);
                track.next_review_at =
                    Some(now + Duration::seconds((self.config.review_days * 86_400.0) as i64));
            }

            instance.support.resolution_evidence_count =
                instance.support.resolution_evidence_count.saturating_add(1);
            let target =
                f64::from(track.correct_count) / f64::from(track.required_correct.max(1));
            instance.support.resolution_confidence =
                instance.support.resolution_confidence.max(target.min(1.0));
            instance.status = match track.status {
                ResolutionStatus::Resolved => MisconceptionStatus::Resolved,
                _ => MisconceptionStatus::Resolving,
            };
        } else {
            track.incorrect_count = track.incorrect_count.saturating_add(1);
            track.last_incorrect_at = Some(now);
            if track.status == ResolutionStatus::Resolved {
                track.status = ResolutionStatus::Relapsed;
                track.relapsed_at = Some(now);
                if self.config.relapse_reset {
                    track.correct_count = 0;
                }
                instance.status = MisconceptionStatus::Relapsed;
                instance.support.resolution_confidence = instance
                    .support
                    .resolution_confidence
                    .min(RELAPSE_CONFIDENCE_CAP);
                instance.support.last_failed_context_after_resolution = Some(FailedContext {
                    question_id: event.question_id().map(str::to_string),
                    block_id: event.block_id().map(|b| b.as_str().to_string()),
                    node_id,
                    occurred_at: Some(event.occurred_at),
                });
            }
        }
    }

    /// Apply an answered question to every listed concept that has a
    /// tracked misconception, persisting the updated tracks and
    /// instances. Returns the concept ids that were updated.
    pub fn resolve_answer(
        &self,
        store: &SqliteRuntimeStore,
        user_id: UserId,
        node_id: Option<NodeId>,
        event: &Event,
        concept_ids: &[ConceptId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ConceptId>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let instances = store.tracked_misconceptions(user_id, concept_ids)?;
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ConceptId> = instances.iter().map(|i| i.canonical_concept_id).collect();
        let mut tracks = store.resolution_states(user_id, &ids)?;

        let mut updated = Vec::new();
        for mut instance in instances {
            let concept_id = instance.canonical_concept_id;
            let mut track = tracks
                .iter()
                .position(|t| t.concept_id == concept_id)
                .map(|i| tracks.swap_remove(i))
                .unwrap_or_else(|| {
                    MisconceptionResolutionState::new(
                        user_id,
                        concept_id,
                        self.config.resolve_min_correct,
                    )
                });
            self.apply_answer(&mut track, &mut instance, event, node_id, now);
            store.upsert_resolution_state(&track)?;
            store.upsert_misconception(&instance)?;
            updated.push(concept_id);
        }
        Ok(updated)
    }
}
