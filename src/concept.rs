//! Concept graph rows and per-user concept state.
//!
//! Concepts, edges, and `ConceptState` are owned by the user-model
//! pipeline; the engine reads them for readiness. Misconception instances
//! and their resolution states are the one concept-adjacent surface the
//! engine writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConceptId, NodeId, PathId, UserId};

/// A concept scoped to a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Concept id
    pub id: ConceptId,
    /// Lookup key as used in documents
    pub key: String,
    /// Path the concept is scoped to
    pub scope_id: PathId,
    /// Canonical concept this one aliases, when deduplicated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_concept_id: Option<ConceptId>,
}

impl Concept {
    /// The id readiness should aggregate under: the canonical id when
    /// set, else the concept's own id.
    pub fn effective_id(&self) -> ConceptId {
        self.canonical_concept_id.unwrap_or(self.id)
    }
}

/// Kind of a concept-graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Prerequisite relationship
    Prereq,
    /// Related concept
    Related,
    /// Analogy
    Analogy,
}

/// A directed edge in the concept graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEdge {
    /// Source concept
    pub from_concept_id: ConceptId,
    /// Target concept
    pub to_concept_id: ConceptId,
    /// Edge kind
    pub edge_type: EdgeType,
    /// Edge strength in [0,1]
    pub strength: f64,
}

/// Per-user mastery state for one concept. Owned by the user-model
/// pipeline; strictly read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptState {
    /// Owning user
    pub user_id: UserId,
    /// Concept
    pub concept_id: ConceptId,
    /// Mastery estimate in [0,1]
    pub mastery: f64,
    /// Confidence in the mastery estimate, [0,1]
    pub confidence: f64,
    /// Reducible (model) uncertainty
    pub epistemic_uncertainty: f64,
    /// Irreducible (noise) uncertainty
    pub aleatoric_uncertainty: f64,
    /// Forgetting half-life in days, when fitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_life_days: Option<f64>,
    /// Last exposure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Scheduled review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

impl ConceptState {
    /// Create a state with the given mastery/confidence and no history.
    pub fn new(user_id: UserId, concept_id: ConceptId, mastery: f64, confidence: f64) -> Self {
        Self {
            user_id,
            concept_id,
            mastery: mastery.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            epistemic_uncertainty: 0.0,
            aleatoric_uncertainty: 0.0,
            half_life_days: None,
            last_seen_at: None,
            next_review_at: None,
        }
    }

    /// The larger of the two uncertainty terms.
    pub fn max_uncertainty(&self) -> f64 {
        self.epistemic_uncertainty.max(self.aleatoric_uncertainty)
    }
}

/// Status of a detected misconception instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisconceptionStatus {
    /// Detected and unaddressed
    Active,
    /// Accumulating resolution evidence
    Resolving,
    /// Resolved
    Resolved,
    /// Resurfaced after resolution
    Relapsed,
}

/// Context of the first failure observed after a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FailedContext {
    /// Question answered incorrectly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    /// Block the question belonged to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Node the learner was in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// When the failure occurred
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Evidence accumulated toward resolving a misconception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MisconceptionSupport {
    /// Correct answers counted as resolution evidence
    #[serde(default)]
    pub resolution_evidence_count: u32,
    /// Confidence that the misconception is resolved, [0,1]
    #[serde(default)]
    pub resolution_confidence: f64,
    /// First post-resolution failure, when relapsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_context_after_resolution: Option<FailedContext>,
}

/// A detected misconception held by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisconceptionInstance {
    /// Owning user
    pub user_id: UserId,
    /// Canonical concept the misconception attaches to
    pub canonical_concept_id: ConceptId,
    /// Lifecycle status
    pub status: MisconceptionStatus,
    /// Detection confidence, [0,1]
    pub confidence: f64,
    /// Misconception pattern, when classified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    /// Resolution evidence
    #[serde(default)]
    pub support: MisconceptionSupport,
}

impl MisconceptionInstance {
    /// Create an active instance.
    pub fn new(user_id: UserId, canonical_concept_id: ConceptId, confidence: f64) -> Self {
        Self {
            user_id,
            canonical_concept_id,
            status: MisconceptionStatus::Active,
            confidence: confidence.clamp(0.0, 1.0),
            pattern_id: None,
            support: MisconceptionSupport::default(),
        }
    }
}

/// Status of a misconception resolution track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// No resolution evidence yet
    Open,
    /// Accumulating correct answers
    Resolving,
    /// Reached the required correct count
    Resolved,
    /// Failed after being resolved
    Relapsed,
}

impl ResolutionStatus {
    /// Whether moving to `next` is a legal lifecycle step. The lifecycle
    /// only moves along `open -> resolving -> resolved -> relapsed`;
    /// relapsed tracks re-enter `resolving`, never `open`.
    pub fn can_transition(self, next: ResolutionStatus) -> bool {
        use ResolutionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Open, Resolving) | (Open, Resolved) => true,
            (Resolving, Resolved) => true,
            (Resolved, Relapsed) => true,
            (Relapsed, Resolving) | (Relapsed, Resolved) => true,
            _ => false,
        }
    }
}

/// Per-(user, concept) resolution progress over answered questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisconceptionResolutionState {
    /// Owning user
    pub user_id: UserId,
    /// Concept under resolution
    pub concept_id: ConceptId,
    /// Lifecycle status
    pub status: ResolutionStatus,
    /// Correct-answer credit accumulated
    pub correct_count: u32,
    /// Credit required to resolve
    pub required_correct: u32,
    /// Incorrect answers observed
    pub incorrect_count: u32,
    /// Last correct answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_correct_at: Option<DateTime<Utc>>,
    /// Last incorrect answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_incorrect_at: Option<DateTime<Utc>>,
    /// When resolution was reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the track relapsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relapsed_at: Option<DateTime<Utc>>,
    /// Scheduled retention review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

impl MisconceptionResolutionState {
    /// Create an open track requiring `required_correct` credits.
    pub fn new(user_id: UserId, concept_id: ConceptId, required_correct: u32) -> Self {
        Self {
            user_id,
            concept_id,
            status: ResolutionStatus::Open,
            correct_count: 0,
            required_correct: required_correct.max(1),
            incorrect_count: 0,
            last_correct_at: None,
            last_incorrect_at: None,
            resolved_at: None,
            relapsed_at: None,
            next_review_at: None,
        }
    }
}
