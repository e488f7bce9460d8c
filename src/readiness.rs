//! Readiness evaluation: a per-(user, node) snapshot of concept mastery,
//! uncertainty, and overdue-review pressure.
//!
//! The evaluator collects the node document's concepts, expands them
//! along strong prerequisite edges, and folds per-concept state into one
//! weighted score that classifies the learner as ready, uncertain, or
//! not ready. Snapshots are cached on the node run and invalidated by
//! answer/completion/prompt-outcome events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::concept::{Concept, ConceptState, EdgeType, MisconceptionInstance};
use crate::config::{CoverageDebtConfig, ReadinessConfig};
use crate::document::NodeDocument;
use crate::error::Result;
use crate::ids::{ConceptId, PathId, UserId};
use crate::storage::SqliteRuntimeStore;

/// Clamp to the unit interval.
pub(crate) fn clip01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Readiness classification of a learner on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    /// Concepts are in good shape
    Ready,
    /// Not clearly ready or unready
    Uncertain,
    /// Remediation is warranted
    NotReady,
}

impl std::fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Uncertain => "uncertain",
            Self::NotReady => "not_ready",
        };
        write!(f, "{}", s)
    }
}

/// The persisted readiness snapshot, cached on the node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    /// Classification
    pub status: ReadinessStatus,
    /// Weighted effective score, [0,1]
    pub score: f64,
    /// Mean decayed mastery over concepts with state
    pub avg_mastery: f64,
    /// Minimum decayed mastery over concepts with state
    pub min_mastery: f64,
    /// Largest uncertainty term seen
    pub max_uncertainty: f64,
    /// Largest coverage debt seen
    pub coverage_debt_max: f64,
    /// Concepts considered
    pub concepts_total: u32,
    /// Concepts with no stored state
    pub concepts_missing: u32,
    /// Active misconceptions among the concepts
    pub misconceptions_active: u32,
    /// Concept keys with weak mastery
    #[serde(default)]
    pub weak_concepts: Vec<String>,
    /// Concept keys with high uncertainty
    #[serde(default)]
    pub uncertain_concepts: Vec<String>,
    /// Concept keys with active misconceptions
    #[serde(default)]
    pub misconception_concepts: Vec<String>,
    /// Concept keys due for review
    #[serde(default)]
    pub due_review_concepts: Vec<String>,
    /// Aggregation weight per concept key
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// When the snapshot was computed
    pub computed_at: DateTime<Utc>,
}

impl ReadinessSnapshot {
    /// Whether the snapshot is still inside its cache window.
    pub fn is_fresh(&self, now: DateTime<Utc>, cache_seconds: u32) -> bool {
        now - self.computed_at <= Duration::seconds(i64::from(cache_seconds))
    }
}

/// Snapshot plus the lookup maps the planner reuses.
#[derive(Debug, Clone)]
pub struct ReadinessResult {
    /// The computed snapshot
    pub snapshot: ReadinessSnapshot,
    /// Concepts by document key
    pub concept_by_key: HashMap<String, Concept>,
    /// Document key by effective concept id
    pub key_by_id: HashMap<ConceptId, String>,
    /// Concept state by effective concept id
    pub states: HashMap<ConceptId, ConceptState>,
    /// Active misconception by effective concept id
    pub misconceptions: HashMap<ConceptId, MisconceptionInstance>,
}

impl ReadinessResult {
    /// Effective concept ids for a set of document keys.
    pub fn concept_ids_for_keys<'a, I>(&self, keys: I) -> Vec<ConceptId>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Vec::new();
        for key in keys {
            if let Some(concept) = self.concept_by_key.get(key) {
                let id = concept.effective_id();
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }
}

/// The assembled per-evaluation concept data, before scoring.
#[derive(Debug, Clone, Default)]
pub struct ConceptBundle {
    /// Canonicalized concepts, document-order then prereqs
    pub concepts: Vec<Concept>,
    /// Aggregation weight per effective id
    pub weights: HashMap<ConceptId, f64>,
    /// Document key per effective id
    pub key_by_id: HashMap<ConceptId, String>,
    /// Concept state per effective id
    pub states: HashMap<ConceptId, ConceptState>,
    /// Active misconception per effective id
    pub misconceptions: HashMap<ConceptId, MisconceptionInstance>,
}

/// Per-concept derived terms.
#[derive(Debug, Clone, Copy)]
struct ConceptTerms {
    mastery: f64,
    confidence: f64,
    uncertainty: f64,
    coverage_debt: f64,
}

/// Readiness evaluator.
#[derive(Debug, Clone)]
pub struct ReadinessEvaluator {
    config: ReadinessConfig,
    coverage: CoverageDebtConfig,
}

impl ReadinessEvaluator {
    /// Create an evaluator with the given tunables.
    pub fn new(config: ReadinessConfig, coverage: CoverageDebtConfig) -> Self {
        Self { config, coverage }
    }

    /// Evaluate readiness for a user on a node document.
    pub fn evaluate(
        &self,
        store: &SqliteRuntimeStore,
        user_id: UserId,
        path_id: PathId,
        document: &NodeDocument,
        now: DateTime<Utc>,
    ) -> Result<ReadinessResult> {
        let bundle = self.assemble(store, user_id, path_id, document)?;
        Ok(self.compute(&bundle, document, now))
    }

    /// Gather concepts, prereq expansion, states, and misconceptions.
    fn assemble(
        &self,
        store: &SqliteRuntimeStore,
        user_id: UserId,
        path_id: PathId,
        document: &NodeDocument,
    ) -> Result<ConceptBundle> {
        let keys = document.all_concept_keys(self.config.use_block_concepts);
        let doc_concepts = store.concepts_by_scope_and_keys(path_id, &keys)?;

        let mut bundle = ConceptBundle::default();
        let mut seen: HashSet<ConceptId> = HashSet::new();
        for concept in doc_concepts {
            let id = concept.effective_id();
            bundle
                .key_by_id
                .entry(id)
                .or_insert_with(|| concept.key.clone());
            bundle.weights.insert(id, 1.0);
            if seen.insert(id) {
                bundle.concepts.push(concept);
            }
        }

        // Expand along strong prereq edges; weight = max edge strength.
        let doc_ids: Vec<ConceptId> = bundle.concepts.iter().map(Concept::effective_id).collect();
        let edges = store.concept_edges_by_to_ids(&doc_ids)?;
        let mut prereq_weight: HashMap<ConceptId, f64> = HashMap::new();
        for edge in edges {
            if edge.edge_type != EdgeType::Prereq
                || edge.strength < self.config.prereq_edge_min_strength
            {
                continue;
            }
            let w = prereq_weight.entry(edge.from_concept_id).or_insert(0.0);
            *w = w.max(edge.strength);
        }
        let prereq_ids: Vec<ConceptId> = prereq_weight
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        if !prereq_ids.is_empty() {
            for concept in store.concepts_by_ids(&prereq_ids)? {
                let raw_id = concept.id;
                let id = concept.effective_id();
                if let Some(&w) = prereq_weight.get(&raw_id) {
                    let entry = bundle.weights.entry(id).or_insert(0.0);
                    *entry = entry.max(w);
                }
                bundle
                    .key_by_id
                    .entry(id)
                    .or_insert_with(|| concept.key.clone());
                if seen.insert(id) {
                    bundle.concepts.push(concept);
                }
            }
        }

        let all_ids: Vec<ConceptId> = bundle.concepts.iter().map(Concept::effective_id).collect();
        for state in store.concept_states(user_id, &all_ids)? {
            bundle.states.insert(state.concept_id, state);
        }
        for instance in store.active_misconceptions(user_id, &all_ids)? {
            bundle
                .misconceptions
                .insert(instance.canonical_concept_id, instance);
        }
        Ok(bundle)
    }

    /// Score an assembled bundle into a snapshot. Pure.
    pub fn compute(
        &self,
        bundle: &ConceptBundle,
        _document: &NodeDocument,
        now: DateTime<Utc>,
    ) -> ReadinessResult {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut mastery_sum = 0.0;
        let mut mastery_count = 0u32;
        let mut min_mastery = f64::NAN;
        let mut max_uncertainty: f64 = 0.0;
        let mut coverage_debt_max: f64 = 0.0;
        let mut concepts_missing = 0u32;
        let mut weak = Vec::new();
        let mut uncertain = Vec::new();
        let mut misconception_keys = Vec::new();
        let mut due_review = Vec::new();
        let mut weights_by_key = HashMap::new();

        for concept in &bundle.concepts {
            let id = concept.effective_id();
            let key = bundle
                .key_by_id
                .get(&id)
                .cloned()
                .unwrap_or_else(|| concept.key.clone());
            let weight = bundle.weights.get(&id).copied().unwrap_or(1.0);
            weights_by_key.insert(key.clone(), weight);
            weight_total += weight;

            if bundle.misconceptions.contains_key(&id) {
                misconception_keys.push(key.clone());
            }

            let Some(state) = bundle.states.get(&id) else {
                concepts_missing += 1;
                weak.push(key);
                continue;
            };

            let terms = self.derive_terms(state, now);
            weighted_sum += weight * effective_score(&terms);
            mastery_sum += terms.mastery;
            mastery_count += 1;
            min_mastery = if min_mastery.is_nan() {
                terms.mastery
            } else {
                min_mastery.min(terms.mastery)
            };
            max_uncertainty = max_uncertainty.max(terms.uncertainty);
            coverage_debt_max = coverage_debt_max.max(terms.coverage_debt);

            if terms.mastery < 0.5 {
                weak.push(key.clone());
            }
            if terms.uncertainty > 0.5 {
                uncertain.push(key.clone());
            }
            if terms.coverage_debt >= self.coverage.threshold {
                due_review.push(key.clone());
            }
        }

        let score = if weight_total > 0.0 {
            clip01(weighted_sum / weight_total)
        } else {
            0.0
        };
        let avg_mastery = if mastery_count > 0 {
            mastery_sum / f64::from(mastery_count)
        } else {
            0.0
        };
        let min_mastery = if min_mastery.is_nan() { 0.0 } else { min_mastery };
        let misconceptions_active = bundle.misconceptions.len() as u32;

        let status = if score >= self.config.ready_min
            && min_mastery >= self.config.min_mastery
            && misconceptions_active <= self.config.max_misconceptions_ready
        {
            ReadinessStatus::Ready
        } else if score < self.config.uncertain_min
            || misconceptions_active > self.config.max_misconceptions_ready
        {
            ReadinessStatus::NotReady
        } else {
            ReadinessStatus::Uncertain
        };

        let snapshot = ReadinessSnapshot {
            status,
            score,
            avg_mastery,
            min_mastery,
            max_uncertainty,
            coverage_debt_max,
            concepts_total: bundle.concepts.len() as u32,
            concepts_missing,
            misconceptions_active,
            weak_concepts: weak,
            uncertain_concepts: uncertain,
            misconception_concepts: misconception_keys,
            due_review_concepts: due_review,
            weights: weights_by_key,
            computed_at: now,
        };

        let mut concept_by_key = HashMap::new();
        for concept in &bundle.concepts {
            concept_by_key
                .entry(concept.key.clone())
                .or_insert_with(|| concept.clone());
        }
        ReadinessResult {
            snapshot,
            concept_by_key,
            key_by_id: bundle.key_by_id.clone(),
            states: bundle.states.clone(),
            misconceptions: bundle.misconceptions.clone(),
        }
    }

    /// Decay, staleness, and coverage debt for one concept state.
    fn derive_terms(&self, state: &ConceptState, now: DateTime<Utc>) -> ConceptTerms {
        let days_since_seen = state
            .last_seen_at
            .map(|seen| (now - seen).num_seconds() as f64 / 86_400.0);

        let mut mastery = state.mastery;
        if self.config.decay_enabled {
            if let Some(days) = days_since_seen {
                if days > 0.0 {
                    let half_life = state
                        .half_life_days
                        .filter(|h| *h > 0.0)
                        .unwrap_or(self.config.decay_half_life_days);
                    let decayed = state.mastery * 0.5_f64.powf(days / half_life);
                    let floor = state.mastery * (1.0 - self.config.decay_max_drop);
                    mastery = decayed.max(floor);
                }
            }
        }

        let mut confidence = state.confidence;
        let mut uncertainty = state.max_uncertainty();
        if let Some(days) = days_since_seen {
            if days > self.config.stale_days {
                let p = clip01((days - self.config.stale_days) / self.config.stale_days);
                confidence *= 1.0 - 0.5 * p;
                uncertainty += 0.3 * p;
            }
        }

        let mut coverage_debt = 0.0;
        if self.coverage.enabled {
            if let Some(due) = state.next_review_at {
                if now > due {
                    let overdue_days = (now - due).num_seconds() as f64 / 86_400.0;
                    coverage_debt = clip01(overdue_days / self.coverage.due_days);
                }
            }
            if let Some(gap) = days_since_seen {
                if gap > self.coverage.due_days {
                    let term = clip01((gap - self.coverage.due_days) / self.coverage.due_days);
                    coverage_debt = coverage_debt.max(term);
                }
            }
            coverage_debt = coverage_debt.min(self.coverage.max);
        }

        ConceptTerms {
            mastery: clip01(mastery),
            confidence: clip01(confidence),
            uncertainty: clip01(uncertainty),
            coverage_debt,
        }
    }
}

/// The per-concept effective score folded into the aggregate.
fn effective_score(terms: &ConceptTerms) -> f64 {
    clip01(terms.mastery * (0.4 + 0.6 * terms.confidence) * (1.0 - 0.2 * terms.coverage_debt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NodeId, PathId};

    fn evaluator() -> ReadinessEvaluator {
        ReadinessEvaluator::new(ReadinessConfig::default(), CoverageDebtConfig::default())
    }

    fn concept(key: &str) -> Concept {
        Concept {
            id: ConceptId::new(),
            key: key.to_string(),
            scope_id: PathId::new(),
            canonical_concept_id: None,
        }
    }

    fn state(concept_id: ConceptId, mastery: f64, confidence: f64) -> ConceptState {
        ConceptState::new(UserId::new(), concept_id, mastery, confidence)
    }

    fn bundle_of(concepts: Vec<Concept>, states: Vec<ConceptState>) -> ConceptBundle {
        let mut bundle = ConceptBundle::default();
        for c in &concepts {
            bundle.weights.insert(c.effective_id(), 1.0);
            bundle.key_by_id.insert(c.effective_id(), c.key.clone());
        }
        bundle.concepts = concepts;
        for s in states {
            bundle.states.insert(s.concept_id, s);
        }
        bundle
    }

    fn empty_doc() -> NodeDocument {
        NodeDocument::new(NodeId::new(), vec![])
    }

    #[test]
    fn test_strong_concepts_are_ready() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let bundle = bundle_of(vec![c], vec![state(id, 0.9, 0.9)]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert_eq!(result.snapshot.status, ReadinessStatus::Ready);
        assert!(result.snapshot.score > 0.7);
        assert!(result.snapshot.weak_concepts.is_empty());
    }

    #[test]
    fn test_weak_concepts_are_not_ready() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let mut st = state(id, 0.3, 0.4);
        st.epistemic_uncertainty = 0.6;
        let bundle = bundle_of(vec![c], vec![st]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert_eq!(result.snapshot.status, ReadinessStatus::NotReady);
        assert_eq!(result.snapshot.weak_concepts, vec!["c1"]);
        assert_eq!(result.snapshot.uncertain_concepts, vec!["c1"]);
    }

    #[test]
    fn test_missing_state_counts_and_blocks_ready() {
        let now = Utc::now();
        let c1 = concept("c1");
        let c2 = concept("c2");
        let id1 = c1.effective_id();
        let bundle = bundle_of(vec![c1, c2], vec![state(id1, 0.95, 0.95)]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert_eq!(result.snapshot.concepts_missing, 1);
        assert_ne!(result.snapshot.status, ReadinessStatus::Ready);
    }

    #[test]
    fn test_misconception_forces_not_ready() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let mut bundle = bundle_of(vec![c], vec![state(id, 0.9, 0.9)]);
        bundle
            .misconceptions
            .insert(id, MisconceptionInstance::new(UserId::new(), id, 0.8));
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert_eq!(result.snapshot.status, ReadinessStatus::NotReady);
        assert_eq!(result.snapshot.misconceptions_active, 1);
        assert_eq!(result.snapshot.misconception_concepts, vec!["c1"]);
    }

    #[test]
    fn test_decay_drops_but_floors() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let mut st = state(id, 0.8, 0.9);
        // Seen long ago: decay would crater mastery but the floor holds
        st.last_seen_at = Some(now - Duration::days(200));
        st.half_life_days = Some(7.0);
        let bundle = bundle_of(vec![c], vec![st]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        let floor = 0.8 * (1.0 - ReadinessConfig::default().decay_max_drop);
        assert!((result.snapshot.min_mastery - floor).abs() < 1e-9);
    }

    #[test]
    fn test_overdue_review_builds_coverage_debt() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let mut st = state(id, 0.8, 0.8);
        st.last_seen_at = Some(now - Duration::days(1));
        st.next_review_at = Some(now - Duration::days(30));
        let bundle = bundle_of(vec![c], vec![st]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert!((result.snapshot.coverage_debt_max - 1.0).abs() < 1e-9);
        assert_eq!(result.snapshot.due_review_concepts, vec!["c1"]);
    }

    #[test]
    fn test_snapshot_bounds() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let mut st = state(id, 1.0, 1.0);
        st.epistemic_uncertainty = 5.0;
        st.last_seen_at = Some(now - Duration::days(400));
        st.next_review_at = Some(now - Duration::days(400));
        let bundle = bundle_of(vec![c], vec![st]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        let s = &result.snapshot;
        for v in [
            s.score,
            s.avg_mastery,
            s.min_mastery,
            s.max_uncertainty,
            s.coverage_debt_max,
        ] {
            assert!((0.0..=1.0).contains(&v), "out of bounds: {}", v);
        }
    }

    #[test]
    fn test_snapshot_freshness() {
        let now = Utc::now();
        let c = concept("c1");
        let id = c.effective_id();
        let bundle = bundle_of(vec![c], vec![state(id, 0.5, 0.5)]);
        let result = evaluator().compute(&bundle, &empty_doc(), now);
        assert!(result.snapshot.is_fresh(now + Duration::seconds(200), 300));
        assert!(!result.snapshot.is_fresh(now + Duration::seconds(400), 300));
    }
}
