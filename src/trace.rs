//! Decision traces: immutable records of every prompt decision.
//!
//! A trace captures the planner's inputs, the full candidate set with
//! score breakdowns, and the chosen action. Exactly one later outcome
//! event may merge a reward into `chosen`; closed outcomes never reopen.
//! Off-policy evaluation and policy training join on the trace id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RlMode;
use crate::ids::{ConceptId, PathId, PromptId, TraceId, UserId};
use crate::readiness::ReadinessSnapshot;
use crate::state::{PromptReason, PromptType};

/// Planner inputs recorded with every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceInputs {
    /// Readiness snapshot at decision time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessSnapshot>,
    /// Fatigue score at decision time
    pub fatigue_score: f64,
    /// Latest progress state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_state: Option<String>,
    /// Confidence of the progress state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_confidence: Option<f64>,
    /// Effective policy mode
    pub policy_mode: RlMode,
    /// Policy snapshot key
    pub policy_key: String,
    /// Policy snapshot version, when loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<i64>,
}

/// One candidate's full score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrace {
    /// Candidate block
    pub block_id: String,
    /// Prompt kind the block would surface as
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    /// Concepts the block assesses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept_ids: Vec<ConceptId>,
    /// Expected information gain
    pub info_gain: f64,
    /// UCB exploration term
    pub explore: f64,
    /// Testlet uncertainty term
    pub testlet_uncertainty: f64,
    /// Readiness boost applied
    pub readiness_boost: f64,
    /// Counterfactual boost applied
    pub counterfactual_boost: f64,
    /// Recency penalty applied
    pub recency_penalty: f64,
    /// Whether the candidate is a counterfactual probe
    pub counterfactual: bool,
    /// Selection reason the candidate would carry
    pub reason: PromptReason,
    /// Baseline score
    pub score: f64,
    /// Policy score (baseline score when no model is loaded)
    pub policy_score: f64,
    /// Softmax probability under baseline scores
    pub baseline_prob: f64,
    /// Softmax probability under policy scores
    pub policy_prob: f64,
}

/// The chosen action plus, once known, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenTrace {
    /// Emitted prompt id
    pub prompt_id: PromptId,
    /// Chosen block; absent for breaks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Prompt kind
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    /// Selection reason
    pub reason: PromptReason,
    /// Baseline score of the chosen candidate
    pub score: f64,
    /// Policy score of the chosen candidate
    pub policy_score: f64,
    /// Probability under the acting distribution
    pub behavior_prob: f64,
    /// Probability under the counterpart distribution
    pub shadow_prob: f64,
    /// Mode the decision acted under
    pub policy_mode: RlMode,
    /// Reward from the outcome event, once observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    /// Outcome event type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_event: Option<String>,
    /// Answer correctness, for answered quick-checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    /// When the outcome arrived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_at: Option<DateTime<Utc>>,
}

impl ChosenTrace {
    /// Whether an outcome has already been recorded.
    pub fn outcome_closed(&self) -> bool {
        self.reward.is_some()
    }
}

/// Outcome merged into `chosen` by the pending-prompt resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenUpdate {
    /// Observed reward
    pub reward: f64,
    /// Outcome event type
    pub outcome_event: String,
    /// Answer correctness, when the outcome was an answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    /// When the outcome arrived
    pub outcome_at: DateTime<Utc>,
}

impl ChosenUpdate {
    /// Apply onto a chosen record. Closed outcomes never advance again.
    /// Returns whether anything changed.
    pub fn apply_to(&self, chosen: &mut ChosenTrace) -> bool {
        if chosen.outcome_closed() {
            return false;
        }
        chosen.reward = Some(self.reward);
        chosen.outcome_event = Some(self.outcome_event.clone());
        chosen.is_correct = self.is_correct;
        chosen.outcome_at = Some(self.outcome_at);
        true
    }
}

/// An immutable decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Trace id
    pub id: TraceId,
    /// Owning user
    pub user_id: UserId,
    /// Decision time
    pub occurred_at: DateTime<Utc>,
    /// Decision surface; always `runtime_prompt` here
    pub decision_type: String,
    /// Path context
    pub path_id: PathId,
    /// Planner inputs
    pub inputs: TraceInputs,
    /// All scored candidates
    pub candidates: Vec<CandidateTrace>,
    /// The chosen action
    pub chosen: ChosenTrace,
}

impl DecisionTrace {
    /// Decision surface name for runtime prompts.
    pub const RUNTIME_PROMPT: &'static str = "runtime_prompt";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chosen() -> ChosenTrace {
        ChosenTrace {
            prompt_id: PromptId::new(),
            block_id: Some("q1".to_string()),
            prompt_type: PromptType::QuickCheck,
            reason: PromptReason::BanditInfoGain,
            score: 0.7,
            policy_score: 0.7,
            behavior_prob: 0.6,
            shadow_prob: 0.6,
            policy_mode: RlMode::Shadow,
            reward: None,
            outcome_event: None,
            is_correct: None,
            outcome_at: None,
        }
    }

    #[test]
    fn test_outcome_applies_once() {
        let now = Utc::now();
        let mut c = chosen();
        let update = ChosenUpdate {
            reward: 1.0,
            outcome_event: "runtime_prompt_completed".to_string(),
            is_correct: None,
            outcome_at: now,
        };
        assert!(update.apply_to(&mut c));
        assert_eq!(c.reward, Some(1.0));

        // A second outcome never reopens the record
        let second = ChosenUpdate {
            reward: 0.0,
            outcome_event: "runtime_prompt_dismissed".to_string(),
            is_correct: None,
            outcome_at: now,
        };
        assert!(!second.apply_to(&mut c));
        assert_eq!(c.reward, Some(1.0));
        assert_eq!(
            c.outcome_event.as_deref(),
            Some("runtime_prompt_completed")
        );
    }

    #[test]
    fn test_chosen_round_trips_with_outcome_fields() {
        let mut c = chosen();
        c.reward = Some(1.0);
        c.is_correct = Some(true);
        let json = serde_json::to_string(&c).unwrap();
        let back: ChosenTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
